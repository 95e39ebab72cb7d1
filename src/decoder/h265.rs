// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Context;

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::picture::Picture;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::PictureHeader;
use crate::codec::h265::rps::RefPicSet;
use crate::codec::h265::rps::RpsSyntax;
use crate::codec::h265::sequence::SequenceParams;
use crate::decoder::ReadyFramesQueue;
use crate::decoder::Result;

/// The limits that decide when to bump, taken from the active sequence.
#[derive(Clone, Copy, Debug)]
struct BumpingLimits {
    max_num_reorder_pics: usize,
    max_latency_pictures: u32,
    max_dec_pic_buffering: usize,
}

enum BumpingType {
    BeforeDecoding,
    AfterDecoding,
}

/// Drives the DPB of an H.265 decoder through the per-picture protocol.
///
/// For every picture, the decoder calls [`DpbManager::new_picture`] with the
/// values of its first slice header, [`DpbManager::begin_picture`] before
/// decoding it, and [`DpbManager::finish_picture`] once it is decoded. Pictures
/// are made available in output order through [`DpbManager::next_output`].
///
/// `T` is the backend payload of the pictures, e.g. their decoded surface.
pub struct DpbManager<T> {
    /// The decoded picture buffer
    dpb: Dpb<T>,
    /// The parameters of the active sequence.
    sequence: Option<SequenceParams>,
    /// The set of reference pictures of the current picture.
    rps: RefPicSet<T>,

    /// Pictures that have been output, in output order.
    ready_queue: ReadyFramesQueue<Picture<T>>,
    /// POC of the last output picture since the last IRAP that reset the
    /// output order.
    last_output_poc: Option<i32>,

    /// Whether this is the first picture in the bitstream in decoding order.
    first_picture_in_bitstream: bool,
    /// Used to identify first picture in decoding order or first picture that
    /// follows an EOS NALU.
    first_picture_after_eos: bool,
    /// prevTid0Pic, see 8.3.1.
    prev_tid_0_pic: Option<PictureData>,
    /// The value of NoRaslOutputFlag for the last IRAP picture.
    irap_no_rasl_output_flag: bool,
}

impl<T> Default for DpbManager<T> {
    fn default() -> Self {
        Self {
            dpb: Default::default(),
            sequence: Default::default(),
            rps: Default::default(),
            ready_queue: Default::default(),
            last_output_poc: Default::default(),
            first_picture_in_bitstream: true,
            first_picture_after_eos: true,
            prev_tid_0_pic: Default::default(),
            irap_no_rasl_output_flag: Default::default(),
        }
    }
}

impl<T> DpbManager<T> {
    pub fn dpb(&self) -> &Dpb<T> {
        &self.dpb
    }

    /// The reference picture set of the picture being decoded.
    pub fn rps(&self) -> &RefPicSet<T> {
        &self.rps
    }

    pub fn sequence(&self) -> Option<&SequenceParams> {
        self.sequence.as_ref()
    }

    fn active_sequence(&self) -> anyhow::Result<&SequenceParams> {
        self.sequence.as_ref().context("No active sequence")
    }

    fn bumping_limits(&self, bumping_type: BumpingType) -> anyhow::Result<BumpingLimits> {
        let sequence = self.active_sequence()?;

        Ok(BumpingLimits {
            max_num_reorder_pics: sequence.max_num_reorder_pics(),
            max_latency_pictures: sequence.sps_max_latency_pictures(),
            max_dec_pic_buffering: match bumping_type {
                BumpingType::BeforeDecoding => sequence.max_dec_pic_buffering(),
                // C.5.2.3 only bumps on the reorder and latency conditions.
                BumpingType::AfterDecoding => 0,
            },
        })
    }

    /// Activates a new set of sequence parameters.
    ///
    /// If the resolution or the DPB size changes, all pending pictures are
    /// output first and `true` is returned so the caller can reallocate its
    /// surfaces.
    pub fn new_sequence(&mut self, params: SequenceParams) -> Result<bool> {
        params.validate()?;

        let max_dpb_size = params.max_dec_pic_buffering();
        let changed = match &self.sequence {
            Some(current) => {
                current.resolution != params.resolution || self.dpb.max_num_pics() != max_dpb_size
            }
            None => true,
        };

        if changed {
            log::debug!(
                "Sequence updated, resolution: {:?} -> {:?}, dpb size: {} -> {}",
                self.sequence.as_ref().map(|s| s.resolution),
                params.resolution,
                self.dpb.max_num_pics(),
                max_dpb_size
            );

            self.drain();
            self.dpb.set_max_num_pics(max_dpb_size);
        }

        self.sequence = Some(params);
        Ok(changed)
    }

    /// Sets up a new picture from the header of its first slice.
    ///
    /// Returns `None` if the picture must be skipped: RASL pictures associated
    /// with an IRAP picture with NoRaslOutputFlag may reference pictures that
    /// are not present in the bitstream.
    pub fn new_picture(
        &mut self,
        hdr: &PictureHeader,
        timestamp: u64,
        system_frame_number: u32,
    ) -> Result<Option<Picture<T>>> {
        let max_pic_order_cnt_lsb = self.active_sequence()?.max_pic_order_cnt_lsb();

        let mut pic = PictureData::new_from_header(
            hdr,
            self.first_picture_in_bitstream,
            self.first_picture_after_eos,
            self.prev_tid_0_pic.as_ref(),
            max_pic_order_cnt_lsb,
            timestamp,
        );
        pic.system_frame_number = system_frame_number;

        self.first_picture_after_eos = false;
        self.first_picture_in_bitstream = false;

        if pic.nalu_type.is_irap() {
            self.irap_no_rasl_output_flag = pic.no_rasl_output_flag;
        } else if pic.nalu_type.is_rasl() && self.irap_no_rasl_output_flag {
            log::debug!(
                "Dropping POC {}, as it is a RASL picture associated with an IRAP with NoRaslOutputFlag",
                pic.pic_order_cnt_val
            );

            return Ok(None);
        }

        log::debug!("New picture POC {}", pic.pic_order_cnt_val);

        Ok(Some(Picture::from_data(pic)))
    }

    /// Derives and marks the reference picture set of `pic`, then outputs and
    /// removes pictures from the DPB as required before `pic` is decoded.
    pub fn begin_picture(&mut self, pic: &Picture<T>, rps_syntax: &RpsSyntax) -> Result<()> {
        let max_pic_order_cnt_lsb = self.active_sequence()?.max_pic_order_cnt_lsb();
        let limits = self.bumping_limits(BumpingType::BeforeDecoding)?;
        let cur_pic = pic.data();

        // 8.3.2
        if cur_pic.nalu_type.is_irap() && cur_pic.no_rasl_output_flag {
            self.dpb.mark_all_as_unused_for_ref();
        }

        self.rps = RefPicSet::derive_pocs(rps_syntax, &cur_pic, max_pic_order_cnt_lsb);
        self.rps.mark(&mut self.dpb);

        self.update_dpb_before_decoding(&cur_pic, limits);

        Ok(())
    }

    // See C.5.2.2
    fn update_dpb_before_decoding(&mut self, cur_pic: &PictureData, limits: BumpingLimits) {
        if cur_pic.nalu_type.is_irap()
            && cur_pic.no_rasl_output_flag
            && !cur_pic.first_picture_in_bitstream
        {
            if cur_pic.no_output_of_prior_pics_flag {
                log::debug!("Discarding {} pictures from the DPB", self.dpb.len());
                self.dpb.clear();
            } else {
                self.dpb.remove_unused();
                while let Some(pic) = self.dpb.bump(false) {
                    self.output_picture(pic);
                }

                if !self.dpb.is_empty() {
                    log::warn!(
                        "IRAP picture failed to clear the DPB, there are still {} pictures in it, \
                         last output POC is {:?}",
                        self.dpb.len(),
                        self.last_output_poc
                    );
                    return;
                }
            }

            self.last_output_poc = None;
        } else {
            self.dpb.remove_unused();
            self.bump_as_needed(limits);
        }
    }

    /// Stores the decoded `pic` in the DPB and outputs pictures as required by
    /// C.5.2.3.
    pub fn finish_picture(&mut self, pic: Picture<T>) -> Result<()> {
        let limits = self.bumping_limits(BumpingType::AfterDecoding)?;

        log::debug!(
            "Finishing picture POC {}, entries in DPB {}",
            pic.data().pic_order_cnt_val,
            self.dpb.len()
        );

        // 8.3.1
        if pic.data().valid_for_prev_tid0_pic {
            self.prev_tid_0_pic = Some(pic.data().clone());
        }

        self.rps = Default::default();

        // First store the current picture in the DPB, only then we should
        // decide whether to bump.
        self.dpb.remove_unused();
        self.dpb.store_picture(pic);
        self.bump_as_needed(limits);

        log::trace!("DPB after finishing the picture: {:#?}", self.dpb);

        Ok(())
    }

    /// Bumps the DPB while the limits require it.
    fn bump_as_needed(&mut self, limits: BumpingLimits) {
        while self.dpb.needs_bumping(
            limits.max_num_reorder_pics,
            limits.max_latency_pictures,
            limits.max_dec_pic_buffering,
        ) {
            match self.dpb.bump(false) {
                Some(pic) => self.output_picture(pic),
                None => {
                    log::warn!("Bumping is needed but no picture to output");
                    break;
                }
            }
        }
    }

    fn output_picture(&mut self, pic: Picture<T>) {
        let poc = pic.data().pic_order_cnt_val;

        if let Some(last_output_poc) = self.last_output_poc {
            if poc < last_output_poc {
                log::warn!(
                    "Outputting out of order {} -> {}, likely a broken stream",
                    last_output_poc,
                    poc
                );
            }
        }

        log::debug!("Adding POC {} to the ready queue", poc);
        self.last_output_poc = Some(poc);
        self.ready_queue.push(pic);
    }

    /// Outputs every picture still waiting in the DPB, then empties it.
    pub fn drain(&mut self) {
        log::debug!("Draining the decoder");

        for pic in self.dpb.drain() {
            self.output_picture(pic);
        }

        self.dpb.clear();
        self.rps = Default::default();
        self.last_output_poc = None;
    }

    /// Drops every picture, including those waiting in the output queue,
    /// without outputting them.
    pub fn flush(&mut self) {
        log::debug!("Flushing the decoder");

        self.dpb.clear();
        self.rps = Default::default();
        self.ready_queue = Default::default();
        self.last_output_poc = None;
        self.prev_tid_0_pic = None;
        self.first_picture_after_eos = true;
    }

    /// Signals an end of sequence NAL unit.
    pub fn end_of_sequence(&mut self) {
        self.first_picture_after_eos = true;
    }

    /// Signals an end of bitstream NAL unit. The next picture starts a new
    /// bitstream, so the pictures still in the DPB are output normally.
    pub fn end_of_bitstream(&mut self) {
        self.first_picture_in_bitstream = true;
    }

    /// Returns the next picture in output order, if any.
    pub fn next_output(&mut self) -> Option<Picture<T>> {
        (&mut self.ready_queue).next()
    }

    /// The number of output pictures waiting to be retrieved.
    pub fn num_pending_output(&self) -> usize {
        self.ready_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::DpbManager;
    use crate::codec::h265::nalu::NaluType;
    use crate::codec::h265::picture::PictureHeader;
    use crate::codec::h265::rps::RpsSyntax;
    use crate::codec::h265::rps::ShortTermRefPicSet;
    use crate::codec::h265::sequence::SequenceParams;
    use crate::decoder::Error;
    use crate::Resolution;

    fn sequence_with_latency(
        max_num_reorder_pics: u8,
        max_latency_increase_plus1: u32,
    ) -> SequenceParams {
        SequenceParams {
            max_dec_pic_buffering_minus1: [5, 0, 0, 0, 0, 0, 0],
            max_num_reorder_pics: [max_num_reorder_pics, 0, 0, 0, 0, 0, 0],
            max_latency_increase_plus1: [max_latency_increase_plus1, 0, 0, 0, 0, 0, 0],
            log2_max_pic_order_cnt_lsb_minus4: 4,
            ..sequence(64)
        }
    }

    fn sequence(width: u32) -> SequenceParams {
        SequenceParams {
            resolution: Resolution { width, height: 64 },
            max_sub_layers_minus1: 0,
            max_dec_pic_buffering_minus1: [4, 0, 0, 0, 0, 0, 0],
            max_num_reorder_pics: [2, 0, 0, 0, 0, 0, 0],
            max_latency_increase_plus1: [0; 7],
            log2_max_pic_order_cnt_lsb_minus4: 0,
        }
    }

    fn rps(before: &[i32], after: &[i32]) -> RpsSyntax {
        RpsSyntax {
            short_term: ShortTermRefPicSet {
                delta_poc_s0: before.to_vec(),
                used_by_curr_pic_s0: vec![true; before.len()],
                delta_poc_s1: after.to_vec(),
                used_by_curr_pic_s1: vec![true; after.len()],
            },
            long_term: vec![],
        }
    }

    fn header(nalu_type: NaluType, poc_lsb: u32) -> PictureHeader {
        PictureHeader {
            nalu_type,
            nuh_temporal_id: 0,
            pic_order_cnt_lsb: poc_lsb,
            pic_output_flag: true,
            no_output_of_prior_pics_flag: false,
        }
    }

    fn decode<T>(manager: &mut DpbManager<T>, hdr: &PictureHeader, rps: &RpsSyntax, payload: T) {
        let pic = manager
            .new_picture(hdr, 0, 0)
            .unwrap()
            .expect("picture should be decoded");
        pic.set_payload(payload);
        manager.begin_picture(&pic, rps).unwrap();
        manager.finish_picture(pic).unwrap();
    }

    fn outputs<T>(manager: &mut DpbManager<T>) -> Vec<i32> {
        std::iter::from_fn(|| manager.next_output())
            .map(|p| p.data().pic_order_cnt_val)
            .collect()
    }

    #[test]
    fn requires_a_sequence() {
        let mut manager = DpbManager::<()>::default();
        let res = manager.new_picture(&header(NaluType::IdrNLp, 0), 0, 0);
        assert!(matches!(res, Err(Error::Other(_))));
    }

    #[test]
    fn rejects_invalid_sequence() {
        let mut manager = DpbManager::<()>::default();
        let mut params = sequence(64);
        params.max_num_reorder_pics[0] = 5;

        assert!(matches!(
            manager.new_sequence(params),
            Err(Error::InvalidSequence(_))
        ));
        assert!(manager.sequence().is_none());
    }

    #[test]
    fn hierarchical_b_frames_output_in_poc_order() {
        let _ = env_logger::try_init();

        let mut manager = DpbManager::default();
        assert!(manager.new_sequence(sequence(64)).unwrap());
        assert_eq!(manager.dpb().max_num_pics(), 5);

        decode(&mut manager, &header(NaluType::IdrWRadl, 0), &rps(&[], &[]), 0);
        decode(&mut manager, &header(NaluType::TrailR, 4), &rps(&[-4], &[]), 4);
        decode(&mut manager, &header(NaluType::TrailR, 2), &rps(&[-2], &[2]), 2);
        // Three pictures waiting with a reorder limit of two.
        assert_eq!(manager.num_pending_output(), 1);

        decode(&mut manager, &header(NaluType::TrailN, 1), &rps(&[-1], &[1, 3]), 1);
        // POCs 0 and 1 are no longer referenced after this one.
        decode(&mut manager, &header(NaluType::TrailN, 3), &rps(&[-1], &[1]), 3);
        assert_eq!(manager.dpb().len(), 3);
        assert_eq!(outputs(&mut manager), vec![0, 1, 2]);

        manager.drain();
        assert!(manager.dpb().is_empty());
        assert_eq!(outputs(&mut manager), vec![3, 4]);
    }

    #[test]
    fn reference_sets_are_resolved_from_the_dpb() {
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence(64)).unwrap();

        decode(&mut manager, &header(NaluType::IdrWRadl, 0), &rps(&[], &[]), ());
        decode(&mut manager, &header(NaluType::TrailR, 4), &rps(&[-4], &[]), ());

        let pic = manager.new_picture(&header(NaluType::TrailR, 2), 0, 2).unwrap().unwrap();
        manager.begin_picture(&pic, &rps(&[-2], &[2])).unwrap();

        let before = manager.rps().ref_pic_set_st_curr_before()[0].clone().unwrap();
        assert_eq!(before.data().pic_order_cnt_val, 0);
        let after = manager.rps().ref_pic_set_st_curr_after()[0].clone().unwrap();
        assert_eq!(after.data().pic_order_cnt_val, 4);

        manager.finish_picture(pic).unwrap();
        assert!(manager.rps().ref_pic_set_st_curr_before().is_empty());
        assert!(manager.dpb().find_by_frame_number(2).is_some());
    }

    /// Counts how many times the payload was released.
    struct Surface(Rc<Cell<u32>>);

    impl Drop for Surface {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn idr_without_output_of_prior_pictures() {
        let released = Rc::new(Cell::new(0));
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence(64)).unwrap();

        let idr = header(NaluType::IdrWRadl, 0);
        decode(&mut manager, &idr, &rps(&[], &[]), Surface(released.clone()));
        let trail = header(NaluType::TrailR, 1);
        decode(&mut manager, &trail, &rps(&[-1], &[]), Surface(released.clone()));
        assert_eq!(manager.num_pending_output(), 0);

        let mut idr = header(NaluType::IdrNLp, 0);
        idr.no_output_of_prior_pics_flag = true;
        decode(&mut manager, &idr, &rps(&[], &[]), Surface(released.clone()));

        // Both prior pictures were dropped without being output.
        assert_eq!(released.get(), 2);
        assert_eq!(manager.dpb().len(), 1);

        manager.drain();
        assert_eq!(outputs(&mut manager), vec![0]);
        assert_eq!(released.get(), 3);
    }

    #[test]
    fn idr_outputs_prior_pictures() {
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence(64)).unwrap();

        decode(&mut manager, &header(NaluType::IdrWRadl, 0), &rps(&[], &[]), ());
        decode(&mut manager, &header(NaluType::TrailR, 1), &rps(&[-1], &[]), ());
        decode(&mut manager, &header(NaluType::IdrNLp, 0), &rps(&[], &[]), ());

        assert_eq!(manager.dpb().len(), 1);
        assert_eq!(outputs(&mut manager), vec![0, 1]);

        manager.drain();
        assert_eq!(outputs(&mut manager), vec![0]);
    }

    #[test]
    fn cra_after_eos_discards_prior_pictures() {
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence(64)).unwrap();

        decode(&mut manager, &header(NaluType::CraNut, 0), &rps(&[], &[]), ());
        decode(&mut manager, &header(NaluType::TrailR, 1), &rps(&[-1], &[]), ());
        manager.end_of_sequence();
        decode(&mut manager, &header(NaluType::CraNut, 8), &rps(&[], &[]), ());

        manager.drain();
        assert_eq!(outputs(&mut manager), vec![8]);
    }

    #[test]
    fn cra_after_end_of_bitstream_outputs_prior_pictures() {
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence(64)).unwrap();

        decode(&mut manager, &header(NaluType::IdrWRadl, 0), &rps(&[], &[]), ());
        decode(&mut manager, &header(NaluType::TrailR, 4), &rps(&[-4], &[]), ());
        manager.end_of_sequence();
        manager.end_of_bitstream();

        let cra = manager.new_picture(&header(NaluType::CraNut, 0), 0, 2).unwrap().unwrap();
        assert!(cra.data().no_rasl_output_flag);
        assert!(!cra.data().no_output_of_prior_pics_flag);
        manager.begin_picture(&cra, &rps(&[], &[])).unwrap();
        manager.finish_picture(cra).unwrap();

        manager.drain();
        assert_eq!(outputs(&mut manager), vec![0, 0, 4]);
    }

    #[test]
    fn latency_bumps_after_decoding() {
        let _ = env_logger::try_init();

        let decode_all = |manager: &mut DpbManager<()>| {
            decode(manager, &header(NaluType::IdrWRadl, 0), &rps(&[], &[]), ());
            decode(manager, &header(NaluType::TrailR, 16), &rps(&[], &[]), ());
            decode(manager, &header(NaluType::TrailR, 8), &rps(&[], &[]), ());
            decode(manager, &header(NaluType::TrailR, 4), &rps(&[], &[]), ());
        };

        // SpsMaxLatencyPictures is 2: POC 16 has waited for two pictures once
        // POC 4 is stored, which pushes out everything up to it.
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence_with_latency(2, 1)).unwrap();
        assert_eq!(manager.sequence().unwrap().sps_max_latency_pictures(), 2);
        decode_all(&mut manager);
        assert_eq!(outputs(&mut manager), vec![0, 4, 8, 16]);
        assert_eq!(manager.dpb().num_needed_for_output(), 0);

        // Without a latency limit only the reorder limit applies.
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence_with_latency(2, 0)).unwrap();
        decode_all(&mut manager);
        assert_eq!(outputs(&mut manager), vec![0, 4]);
        assert_eq!(manager.dpb().num_needed_for_output(), 2);
    }

    #[test]
    fn rasl_pictures_of_first_cra_are_dropped() {
        let mut manager = DpbManager::<()>::default();
        manager.new_sequence(sequence(64)).unwrap();

        let cra = manager.new_picture(&header(NaluType::CraNut, 4), 0, 0).unwrap();
        assert!(cra.is_some());
        let rasl = manager.new_picture(&header(NaluType::RaslN, 2), 0, 1).unwrap();
        assert!(rasl.is_none());

        // A CRA in the middle of the stream keeps its RASL pictures.
        let cra = manager.new_picture(&header(NaluType::CraNut, 12), 0, 2).unwrap();
        assert!(!cra.unwrap().data().no_rasl_output_flag);
        let rasl = manager.new_picture(&header(NaluType::RaslN, 10), 0, 3).unwrap();
        assert!(rasl.is_some());
    }

    #[test]
    fn new_resolution_drains_the_dpb() {
        let mut manager = DpbManager::default();
        assert!(manager.new_sequence(sequence(64)).unwrap());

        decode(&mut manager, &header(NaluType::IdrWRadl, 0), &rps(&[], &[]), ());
        decode(&mut manager, &header(NaluType::TrailR, 1), &rps(&[-1], &[]), ());

        // Same parameters, nothing to do.
        assert!(!manager.new_sequence(sequence(64)).unwrap());
        assert_eq!(manager.dpb().len(), 2);

        assert!(manager.new_sequence(sequence(128)).unwrap());
        assert!(manager.dpb().is_empty());
        assert_eq!(outputs(&mut manager), vec![0, 1]);
    }

    #[test]
    fn flush_drops_everything() {
        let mut manager = DpbManager::default();
        manager.new_sequence(sequence(64)).unwrap();

        for (i, poc) in [0, 4, 2, 1].into_iter().enumerate() {
            let nalu_type = if i == 0 { NaluType::IdrWRadl } else { NaluType::TrailR };
            decode(&mut manager, &header(nalu_type, poc), &rps(&[], &[]), ());
        }
        assert!(manager.num_pending_output() > 0);

        manager.flush();
        assert!(manager.dpb().is_empty());
        assert_eq!(manager.num_pending_output(), 0);
        assert!(manager.next_output().is_none());
    }
}
