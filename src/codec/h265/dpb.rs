// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;

use crate::codec::h265::picture::Picture;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::Reference;

/// The decoded picture buffer. Pictures are kept in decoding order.
pub struct Dpb<T> {
    /// List of decoded pictures, in the order they were stored.
    entries: Vec<Picture<T>>,
    /// The maximum number of pictures that can be stored.
    max_num_pics: usize,
    /// The number of pictures in `entries` that are needed for output.
    num_needed_for_output: usize,
}

impl<T> Dpb<T> {
    /// Returns an iterator over the underlying H265 pictures stored in the
    /// DPB.
    pub fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|p| p.data())
    }

    /// Returns the length of the DPB.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the whole DPB entries.
    pub fn entries(&self) -> &[Picture<T>] {
        &self.entries
    }

    /// Returns a new handle to every picture in the DPB. The returned handles
    /// stay valid whatever happens to the DPB afterwards.
    pub fn pictures_all(&self) -> Vec<Picture<T>> {
        self.entries.to_vec()
    }

    /// Set the dpb's max num pics.
    pub fn set_max_num_pics(&mut self, max_num_pics: usize) {
        self.max_num_pics = max_num_pics;
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// The number of pictures waiting to be output.
    pub fn num_needed_for_output(&self) -> usize {
        self.num_needed_for_output
    }

    /// The number of pictures marked as used for reference.
    pub fn num_ref_pictures(&self) -> usize {
        self.pictures().filter(|p| p.is_ref()).count()
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for picture in &self.entries {
            picture.data_mut().set_reference(Reference::None);
        }
    }

    /// Gets the position of `needle` in the DPB, if any.
    fn get_position(&self, needle: &Picture<T>) -> Option<usize> {
        self.entries.iter().position(|p| Picture::ptr_eq(p, needle))
    }

    /// Returns the first picture, in decoding order, for which `predicate`
    /// holds.
    fn find(&self, predicate: impl Fn(&PictureData) -> bool) -> Option<Picture<T>> {
        self.entries.iter().find(|p| predicate(&*p.data())).cloned()
    }

    /// Finds a reference picture in the DPB using `poc`.
    pub fn find_ref_by_poc(&self, poc: i32) -> Option<Picture<T>> {
        let found = self.find(|p| p.is_ref() && p.pic_order_cnt_val == poc);

        log::debug!("find_ref_by_poc: {}, found: {}", poc, found.is_some());
        found
    }

    /// Finds a short term reference picture in the DPB using `poc`.
    pub fn find_short_term_ref_by_poc(&self, poc: i32) -> Option<Picture<T>> {
        let found = self.find(|p| {
            matches!(p.reference(), Reference::ShortTerm) && p.pic_order_cnt_val == poc
        });

        log::debug!("find_short_term_ref_by_poc: {}, found: {}", poc, found.is_some());
        found
    }

    /// Finds a long term reference picture in the DPB using `poc`.
    pub fn find_long_term_ref_by_poc(&self, poc: i32) -> Option<Picture<T>> {
        let found = self.find(|p| {
            matches!(p.reference(), Reference::LongTerm) && p.pic_order_cnt_val == poc
        });

        log::debug!("find_long_term_ref_by_poc: {}, found: {}", poc, found.is_some());
        found
    }

    /// Finds a reference picture in the DPB using only the LSBs of its POC.
    pub fn find_ref_by_poc_lsb(&self, poc_lsb: i32) -> Option<Picture<T>> {
        let found = self.find(|p| p.is_ref() && p.slice_pic_order_cnt_lsb == poc_lsb);

        log::debug!("find_ref_by_poc_lsb: {}, found: {}", poc_lsb, found.is_some());
        found
    }

    /// Finds the picture that was submitted as `system_frame_number`.
    pub fn find_by_frame_number(&self, system_frame_number: u32) -> Option<Picture<T>> {
        self.find(|p| p.system_frame_number == system_frame_number)
    }

    /// Drains the DPB by continuously invoking the bumping process.
    pub fn drain(&mut self) -> Vec<Picture<T>> {
        log::debug!("Draining the DPB.");

        let mut pics = vec![];
        while let Some(pic) = self.bump(true) {
            pics.push(pic);
        }

        pics
    }

    /// Whether the DPB needs bumping. See C.5.2.2 and C.5.2.3.
    ///
    /// `max_latency_increase` is SpsMaxLatencyPictures, and
    /// `max_dec_pic_buffering` is sps_max_dec_pic_buffering_minus1 + 1. Passing
    /// zero for either disables the corresponding condition.
    pub fn needs_bumping(
        &self,
        max_num_reorder_pics: usize,
        max_latency_increase: u32,
        max_dec_pic_buffering: usize,
    ) -> bool {
        if self.max_num_pics != 0 && self.len() > self.max_num_pics {
            log::debug!(
                "Bumping needed: the DPB holds {} pictures, more than {}",
                self.len(),
                self.max_num_pics
            );
            return true;
        }

        if self.num_needed_for_output > max_num_reorder_pics {
            log::debug!(
                "Bumping needed: {} pictures needed for output, max_num_reorder_pics is {}",
                self.num_needed_for_output,
                max_num_reorder_pics
            );
            return true;
        }

        if self.num_needed_for_output > 0 && max_latency_increase != 0 {
            let pic_over_max_latency = self
                .pictures()
                .any(|p| p.needed_for_output() && p.pic_latency_cnt() >= max_latency_increase);

            if pic_over_max_latency {
                log::debug!(
                    "Bumping needed: a picture reached the max latency {}",
                    max_latency_increase
                );
                return true;
            }
        }

        if max_dec_pic_buffering != 0 && self.len() >= max_dec_pic_buffering {
            log::debug!(
                "Bumping needed: the DPB holds {} pictures, max_dec_pic_buffering is {}",
                self.len(),
                max_dec_pic_buffering
            );
            return true;
        }

        false
    }

    /// Find the lowest POC in the DPB that can be bumped. Ties go to the
    /// picture stored first.
    fn find_lowest_poc_for_bumping(&self) -> Option<usize> {
        let mut lowest: Option<(usize, i32)> = None;

        for (position, pic) in self.pictures().enumerate() {
            if !pic.needed_for_output() {
                continue;
            }

            match lowest {
                Some((_, poc)) if poc <= pic.pic_order_cnt_val => (),
                _ => lowest = Some((position, pic.pic_order_cnt_val)),
            }
        }

        lowest.map(|(position, _)| position)
    }

    /// See C.5.2.4 "Bumping process".
    ///
    /// Outputs the picture with the lowest POC among those needed for output.
    /// The picture leaves the DPB if it is not used for reference, or if
    /// `flush` is set.
    pub fn bump(&mut self, flush: bool) -> Option<Picture<T>> {
        let position = self.find_lowest_poc_for_bumping()?;
        let handle = self.entries[position].clone();

        let mut pic = handle.data_mut();
        pic.set_needed_for_output(false);

        debug_assert!(self.num_needed_for_output > 0);
        self.num_needed_for_output = self.num_needed_for_output.saturating_sub(1);

        log::debug!("Bumping picture POC {} from the dpb", pic.pic_order_cnt_val);

        if !pic.is_ref() || flush {
            log::debug!("Removed picture POC {} from dpb", pic.pic_order_cnt_val);
            drop(pic);
            self.entries.remove(position);
        } else {
            drop(pic);
        }

        self.debug_check_output_count();

        Some(handle)
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");

        self.entries.clear();
        self.num_needed_for_output = 0;
    }

    /// Removes all pictures which are marked as "not needed for output" and
    /// "unused for reference". See C.5.2.2
    pub fn remove_unused(&mut self) {
        log::debug!("Removing unused pictures from DPB.");
        self.entries.retain(|p| {
            let pic = p.data();
            let retain = pic.needed_for_output() || pic.is_ref();
            log::debug!("Retaining pic POC: {}: {}", pic.pic_order_cnt_val, retain);
            retain
        });

        self.debug_check_output_count();
    }

    /// Store a picture in the DPB.
    ///
    /// The picture becomes a short term reference, and is marked as needed for
    /// output if its `pic_output_flag` is set. Storing a picture that is
    /// already in the DPB is a programming error.
    pub fn store_picture(&mut self, picture: Picture<T>) {
        assert!(
            self.get_position(&picture).is_none(),
            "picture POC {} is already in the DPB",
            picture.data().pic_order_cnt_val
        );

        let mut pic = picture.data_mut();
        log::debug!(
            "Stored picture POC {:?}, the DPB length is {:?}",
            pic.pic_order_cnt_val,
            self.entries.len()
        );

        // C.5.2.3: the latency count of every picture waiting for output
        // increases when a picture that will be output is stored.
        if pic.pic_output_flag {
            for other in &self.entries {
                let mut other = other.data_mut();
                if other.needed_for_output() {
                    let pic_latency_cnt = other.pic_latency_cnt().saturating_add(1);
                    other.set_pic_latency_cnt(pic_latency_cnt);
                }
            }

            pic.set_needed_for_output(true);
            pic.set_pic_latency_cnt(0);
            self.num_needed_for_output += 1;
        } else {
            pic.set_needed_for_output(false);
        }

        // C.3.4.
        // After all the slices of the current picture have been decoded, this
        // picture is marked as "used for short-term reference".
        pic.set_reference(Reference::ShortTerm);
        drop(pic);

        self.entries.push(picture);
        self.debug_check_output_count();
    }

    /// Returns all the references in the DPB.
    pub fn get_all_references(&self) -> Vec<Picture<T>> {
        self.entries.iter().filter(|p| p.data().is_ref()).cloned().collect()
    }

    fn debug_check_output_count(&self) {
        debug_assert_eq!(
            self.num_needed_for_output,
            self.pictures().filter(|p| p.needed_for_output()).count(),
            "output count out of sync with the stored pictures"
        );
    }
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            num_needed_for_output: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self.entries.iter().enumerate().collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("num_needed_for_output", &self.num_needed_for_output)
            .finish()
    }
}
