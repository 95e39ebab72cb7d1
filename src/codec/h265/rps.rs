// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture set derivation and picture marking. See 8.3.2.

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::picture::Picture;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::Reference;

/// A short term reference picture set, with the POC deltas already derived
/// (DeltaPocS0/DeltaPocS1 and UsedByCurrPicS0/UsedByCurrPicS1).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub delta_poc_s0: Vec<i32>,
    pub used_by_curr_pic_s0: Vec<bool>,
    pub delta_poc_s1: Vec<i32>,
    pub used_by_curr_pic_s1: Vec<bool>,
}

/// A long term reference picture entry of the slice header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LongTermRefPic {
    /// PocLsbLt.
    pub poc_lsb_lt: u32,
    /// UsedByCurrPicLt.
    pub used_by_curr_pic_lt: bool,
    pub delta_poc_msb_present_flag: bool,
    /// DeltaPocMsbCycleLt, i.e. the accumulated value of equation 7-52.
    pub delta_poc_msb_cycle_lt: u32,
}

/// The reference picture set syntax that applies to the current picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpsSyntax {
    pub short_term: ShortTermRefPicSet,
    pub long_term: Vec<LongTermRefPic>,
}

/// The RefPicSet data, derived once per picture.
#[derive(Clone, Debug)]
pub struct RefPicSet<T> {
    curr_delta_poc_msb_present_flag: Vec<bool>,
    foll_delta_poc_msb_present_flag: Vec<bool>,

    poc_st_curr_before: Vec<i32>,
    poc_st_curr_after: Vec<i32>,
    poc_st_foll: Vec<i32>,
    poc_lt_curr: Vec<i32>,
    poc_lt_foll: Vec<i32>,

    ref_pic_set_lt_curr: Vec<Option<Picture<T>>>,
    ref_pic_set_lt_foll: Vec<Option<Picture<T>>>,
    ref_pic_set_st_curr_before: Vec<Option<Picture<T>>>,
    ref_pic_set_st_curr_after: Vec<Option<Picture<T>>>,
    ref_pic_set_st_foll: Vec<Option<Picture<T>>>,
}

impl<T> Default for RefPicSet<T> {
    fn default() -> Self {
        Self {
            curr_delta_poc_msb_present_flag: Default::default(),
            foll_delta_poc_msb_present_flag: Default::default(),
            poc_st_curr_before: Default::default(),
            poc_st_curr_after: Default::default(),
            poc_st_foll: Default::default(),
            poc_lt_curr: Default::default(),
            poc_lt_foll: Default::default(),
            ref_pic_set_lt_curr: Default::default(),
            ref_pic_set_lt_foll: Default::default(),
            ref_pic_set_st_curr_before: Default::default(),
            ref_pic_set_st_curr_after: Default::default(),
            ref_pic_set_st_foll: Default::default(),
        }
    }
}

impl<T> RefPicSet<T> {
    /// Computes the five POC lists of the current picture. See the first half
    /// of 8.3.2. IDR pictures have an empty RPS.
    pub fn derive_pocs(
        syntax: &RpsSyntax,
        cur_pic: &PictureData,
        max_pic_order_cnt_lsb: i32,
    ) -> Self {
        let mut rps = Self::default();

        if cur_pic.nalu_type.is_idr() {
            return rps;
        }

        let st = &syntax.short_term;
        for (delta, used) in st.delta_poc_s0.iter().zip(&st.used_by_curr_pic_s0) {
            let poc = cur_pic.pic_order_cnt_val + delta;

            if *used {
                rps.poc_st_curr_before.push(poc);
            } else {
                rps.poc_st_foll.push(poc);
            }
        }

        for (delta, used) in st.delta_poc_s1.iter().zip(&st.used_by_curr_pic_s1) {
            let poc = cur_pic.pic_order_cnt_val + delta;

            if *used {
                rps.poc_st_curr_after.push(poc);
            } else {
                rps.poc_st_foll.push(poc);
            }
        }

        for lt in &syntax.long_term {
            let mut poc_lt = lt.poc_lsb_lt as i32;
            if lt.delta_poc_msb_present_flag {
                // Broken streams can carry any DeltaPocMsbCycleLt.
                let msb_cycle =
                    (lt.delta_poc_msb_cycle_lt as i32).wrapping_mul(max_pic_order_cnt_lsb);
                poc_lt = poc_lt
                    .wrapping_add(cur_pic.pic_order_cnt_val)
                    .wrapping_sub(msb_cycle)
                    .wrapping_sub(cur_pic.pic_order_cnt_val & (max_pic_order_cnt_lsb - 1));
            }

            if lt.used_by_curr_pic_lt {
                rps.poc_lt_curr.push(poc_lt);
                rps.curr_delta_poc_msb_present_flag.push(lt.delta_poc_msb_present_flag);
            } else {
                rps.poc_lt_foll.push(poc_lt);
                rps.foll_delta_poc_msb_present_flag.push(lt.delta_poc_msb_present_flag);
            }
        }

        rps
    }

    fn find_long_term(
        dpb: &Dpb<T>,
        poc: i32,
        delta_poc_msb_present_flag: bool,
    ) -> Option<Picture<T>> {
        let reference = if delta_poc_msb_present_flag {
            dpb.find_ref_by_poc(poc)
        } else {
            dpb.find_ref_by_poc_lsb(poc)
        };

        if reference.is_none() {
            log::warn!("No long term reference found for poc {}", poc);
        }

        reference
    }

    fn find_short_term(dpb: &Dpb<T>, pocs: &[i32]) -> Vec<Option<Picture<T>>> {
        pocs.iter()
            .map(|&poc| {
                let reference = dpb.find_short_term_ref_by_poc(poc);

                if reference.is_none() {
                    log::warn!("No short term reference found for poc {}", poc);
                }

                reference
            })
            .collect()
    }

    /// Resolves the POC lists against the DPB and marks the pictures in it
    /// accordingly. See the second half of 8.3.2.
    pub fn mark(&mut self, dpb: &mut Dpb<T>) {
        // Equation 8-6
        self.ref_pic_set_lt_curr = self
            .poc_lt_curr
            .iter()
            .zip(&self.curr_delta_poc_msb_present_flag)
            .map(|(&poc, &msb_present)| Self::find_long_term(dpb, poc, msb_present))
            .collect();

        self.ref_pic_set_lt_foll = self
            .poc_lt_foll
            .iter()
            .zip(&self.foll_delta_poc_msb_present_flag)
            .map(|(&poc, &msb_present)| Self::find_long_term(dpb, poc, msb_present))
            .collect();

        for pic in self.ref_pic_set_lt_curr.iter().chain(&self.ref_pic_set_lt_foll).flatten() {
            pic.data_mut().set_reference(Reference::LongTerm);
        }

        // Equation 8-7
        self.ref_pic_set_st_curr_before = Self::find_short_term(dpb, &self.poc_st_curr_before);
        self.ref_pic_set_st_curr_after = Self::find_short_term(dpb, &self.poc_st_curr_after);
        self.ref_pic_set_st_foll = Self::find_short_term(dpb, &self.poc_st_foll);

        // All reference pictures in the DPB that are not included in
        // RefPicSetLtCurr, RefPicSetLtFoll, RefPicSetStCurrBefore,
        // RefPicSetStCurrAfter, or RefPicSetStFoll are marked as "unused for
        // reference".
        for dpb_pic in dpb.entries() {
            let poc = dpb_pic.data().pic_order_cnt_val;
            let in_rps = self
                .ref_pic_set_lt_curr
                .iter()
                .chain(&self.ref_pic_set_lt_foll)
                .chain(&self.ref_pic_set_st_curr_before)
                .chain(&self.ref_pic_set_st_curr_after)
                .chain(&self.ref_pic_set_st_foll)
                .flatten()
                .any(|p| p.data().pic_order_cnt_val == poc);

            if !in_rps && dpb_pic.data().is_ref() {
                dpb_pic.data_mut().set_reference(Reference::None);
            }
        }
    }

    pub fn poc_st_curr_before(&self) -> &[i32] {
        &self.poc_st_curr_before
    }

    pub fn poc_st_curr_after(&self) -> &[i32] {
        &self.poc_st_curr_after
    }

    pub fn poc_st_foll(&self) -> &[i32] {
        &self.poc_st_foll
    }

    pub fn poc_lt_curr(&self) -> &[i32] {
        &self.poc_lt_curr
    }

    pub fn poc_lt_foll(&self) -> &[i32] {
        &self.poc_lt_foll
    }

    pub fn ref_pic_set_st_curr_before(&self) -> &[Option<Picture<T>>] {
        &self.ref_pic_set_st_curr_before
    }

    pub fn ref_pic_set_st_curr_after(&self) -> &[Option<Picture<T>>] {
        &self.ref_pic_set_st_curr_after
    }

    pub fn ref_pic_set_st_foll(&self) -> &[Option<Picture<T>>] {
        &self.ref_pic_set_st_foll
    }

    pub fn ref_pic_set_lt_curr(&self) -> &[Option<Picture<T>>] {
        &self.ref_pic_set_lt_curr
    }

    pub fn ref_pic_set_lt_foll(&self) -> &[Option<Picture<T>>] {
        &self.ref_pic_set_lt_foll
    }

    /// NumPicTotalCurr, ignoring pps_curr_pic_ref_enabled_flag. See 7-55.
    pub fn num_pic_total_curr(&self) -> usize {
        self.poc_st_curr_before.len() + self.poc_st_curr_after.len() + self.poc_lt_curr.len()
    }
}
