// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use crate::codec::h265::nalu::NaluType;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// The slice header values needed to set up a picture, as parsed from the
/// first slice segment of that picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureHeader {
    pub nalu_type: NaluType,
    /// TemporalId of the NAL unit, i.e. nuh_temporal_id_plus1 - 1.
    pub nuh_temporal_id: u8,
    /// slice_pic_order_cnt_lsb. Zero for IDR pictures.
    pub pic_order_cnt_lsb: u32,
    /// pic_output_flag, or 1 if not present.
    pub pic_output_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
}

/// Data associated with an h.265 picture. Most fields are extracted from the
/// slice header and kept for future processing.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    // Fields extracted from the slice header. These are the CamelCase
    // variables, unless noted otherwise.
    pub nalu_type: NaluType,
    pub no_rasl_output_flag: bool,
    pub pic_output_flag: bool,
    pub valid_for_prev_tid0_pic: bool,
    pub slice_pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_val: i32,
    pub no_output_of_prior_pics_flag: bool,

    // Internal state.
    pub first_picture_in_bitstream: bool,
    pub first_picture_after_eos: bool,
    /// Identifies the decode submission this picture belongs to.
    pub system_frame_number: u32,
    pub timestamp: u64,
    pub(crate) reference: Reference,
    // Only the DPB may touch these, as it keeps a count of the pictures
    // needed for output.
    pub(crate) pic_latency_cnt: u32,
    pub(crate) needed_for_output: bool,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the header of its first slice.
    ///
    /// See 8.1.3 Decoding process for a coded picture with nuh_layer_id equal
    /// to 0.
    ///
    /// This will also call the picture order count process (clause 8.3.1) to
    /// correctly initialize the POC values.
    pub fn new_from_header(
        hdr: &PictureHeader,
        first_picture_in_bitstream: bool,
        first_picture_after_eos: bool,
        prev_tid0_pic: Option<&PictureData>,
        max_pic_order_cnt_lsb: i32,
        timestamp: u64,
    ) -> Self {
        let nalu_type = hdr.nalu_type;

        // We assume HandleCraAsBlaFlag == 0, as it is only set through
        // external means, which we do not provide.

        let mut pic_order_cnt_msb = 0;
        let slice_pic_order_cnt_lsb = (hdr.pic_order_cnt_lsb as i32) & (max_pic_order_cnt_lsb - 1);

        // The value of NoRaslOutputFlag is equal to 1 for each IDR access
        // unit, each BLA access unit, and each CRA access unit that is the
        // first access unit in the bitstream in decoding order, is the first
        // access unit that follows an end of sequence NAL unit in decoding
        // order, or has HandleCraAsBlaFlag equal to 1.
        let no_rasl_output_flag = nalu_type.is_idr()
            || nalu_type.is_bla()
            || (nalu_type.is_cra() && (first_picture_in_bitstream || first_picture_after_eos));

        // Compute the Picture Order Count. See 8.3.1 Decoding Process for
        // Picture Order Count
        if !(nalu_type.is_irap() && no_rasl_output_flag) {
            if let Some(prev_tid0_pic) = prev_tid0_pic {
                // Equation (8-1)
                let prev_pic_order_cnt_lsb = prev_tid0_pic.slice_pic_order_cnt_lsb;
                let prev_pic_order_cnt_msb = prev_tid0_pic.pic_order_cnt_msb;
                if (slice_pic_order_cnt_lsb < prev_pic_order_cnt_lsb)
                    && (prev_pic_order_cnt_lsb - slice_pic_order_cnt_lsb)
                        >= (max_pic_order_cnt_lsb / 2)
                {
                    pic_order_cnt_msb = prev_pic_order_cnt_msb + max_pic_order_cnt_lsb;
                } else if (slice_pic_order_cnt_lsb > prev_pic_order_cnt_lsb)
                    && (slice_pic_order_cnt_lsb - prev_pic_order_cnt_lsb)
                        > (max_pic_order_cnt_lsb / 2)
                {
                    pic_order_cnt_msb = prev_pic_order_cnt_msb - max_pic_order_cnt_lsb;
                } else {
                    pic_order_cnt_msb = prev_pic_order_cnt_msb;
                }
            }
        }

        // Let prevTid0Pic be the previous picture in decoding order that has
        // TemporalId equal to 0 and that is not a RASL, RADL or SLNR picture.
        let valid_for_prev_tid0_pic = hdr.nuh_temporal_id == 0
            && !nalu_type.is_radl()
            && !nalu_type.is_rasl()
            && !nalu_type.is_slnr();

        // C.5.2.2: a CRA picture with NoRaslOutputFlag always discards the
        // prior pictures, otherwise the syntax element decides.
        let no_output_of_prior_pics_flag =
            if nalu_type.is_irap() && no_rasl_output_flag && !first_picture_in_bitstream {
                nalu_type.is_cra() || hdr.no_output_of_prior_pics_flag
            } else {
                false
            };

        Self {
            nalu_type,
            no_rasl_output_flag,
            no_output_of_prior_pics_flag,
            pic_output_flag: hdr.pic_output_flag,
            valid_for_prev_tid0_pic,
            slice_pic_order_cnt_lsb,
            pic_order_cnt_msb,
            // Equation (8-2)
            pic_order_cnt_val: pic_order_cnt_msb + slice_pic_order_cnt_lsb,
            first_picture_in_bitstream,
            first_picture_after_eos,
            system_frame_number: 0,
            timestamp,
            reference: Default::default(),
            pic_latency_cnt: 0,
            needed_for_output: false,
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    /// Whether the current picture is a long term reference.
    pub fn is_long_term(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!("Set reference of POC {} to {:?}", self.pic_order_cnt_val, reference);

        self.reference = reference;
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Whether the picture is still waiting to be output.
    pub fn needed_for_output(&self) -> bool {
        self.needed_for_output
    }

    /// The number of pictures stored in the DPB after this one while it was
    /// waiting to be output.
    pub fn pic_latency_cnt(&self) -> u32 {
        self.pic_latency_cnt
    }

    pub(crate) fn set_needed_for_output(&mut self, needed_for_output: bool) {
        self.needed_for_output = needed_for_output;
    }

    pub(crate) fn set_pic_latency_cnt(&mut self, pic_latency_cnt: u32) {
        self.pic_latency_cnt = pic_latency_cnt;
    }
}

struct PictureInner<T> {
    data: RefCell<PictureData>,
    payload: RefCell<Option<T>>,
}

/// A shared handle to a decoded picture and its backend payload.
///
/// Cloning the handle adds an owner; dropping it removes one. The payload is
/// dropped together with the last handle, which makes the `Drop` implementation
/// of `T` the place to release backend resources such as surfaces.
pub struct Picture<T>(Rc<PictureInner<T>>);

impl<T> Picture<T> {
    /// Creates a picture with default data and no payload.
    pub fn new() -> Self {
        Self::from_data(Default::default())
    }

    pub fn from_data(data: PictureData) -> Self {
        Self(Rc::new(PictureInner {
            data: RefCell::new(data),
            payload: RefCell::new(None),
        }))
    }

    pub fn with_payload(data: PictureData, payload: T) -> Self {
        let picture = Self::from_data(data);
        picture.set_payload(payload);
        picture
    }

    pub fn data(&self) -> Ref<'_, PictureData> {
        self.0.data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, PictureData> {
        self.0.data.borrow_mut()
    }

    /// Attaches `payload` to the picture. A previously attached payload is
    /// dropped before the new one is stored.
    pub fn set_payload(&self, payload: T) {
        drop(self.0.payload.take());
        *self.0.payload.borrow_mut() = Some(payload);
    }

    /// Borrows the payload, if any.
    pub fn payload(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.0.payload.borrow(), Option::as_ref).ok()
    }

    /// Moves the payload out of the picture, e.g. to hand the backend surface
    /// over to its consumer.
    pub fn take_payload(&self) -> Option<T> {
        self.0.payload.take()
    }

    /// Whether `a` and `b` refer to the same picture.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// The number of live handles to this picture.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl<T> Clone for Picture<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T> Default for Picture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<PictureData> for Picture<T> {
    fn from(data: PictureData) -> Self {
        Self::from_data(data)
    }
}

impl<T> std::fmt::Debug for Picture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("data", &self.0.data)
            .field("has_payload", &self.0.payload.borrow().is_some())
            .finish()
    }
}
