// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::Resolution;

/// The maximum number of sub-layers in a coded video sequence.
pub const MAX_SUB_LAYERS: usize = 7;
/// The largest DPB size allowed by any level. See A.4.2.
pub const MAX_DPB_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("sps_max_sub_layers_minus1 is {0}, but at most 6 is allowed")]
    TooManySubLayers(u8),
    #[error("sps_max_dec_pic_buffering_minus1 is {0}, but the DPB holds at most 16 pictures")]
    DpbTooLarge(u8),
    #[error("sps_max_num_reorder_pics ({reorder}) exceeds sps_max_dec_pic_buffering_minus1 ({buffering})")]
    ReorderExceedsBuffering { reorder: u8, buffering: u8 },
    #[error("log2_max_pic_order_cnt_lsb_minus4 is {0}, but at most 12 is allowed")]
    PocLsbTooLarge(u8),
}

/// The values of an H.265 sequence parameter set that drive the DPB. These are
/// the raw syntax elements, indexed by `HighestTid` where applicable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceParams {
    /// Coded resolution of the sequence.
    pub resolution: Resolution,
    /// sps_max_sub_layers_minus1.
    pub max_sub_layers_minus1: u8,
    /// sps_max_dec_pic_buffering_minus1[i].
    pub max_dec_pic_buffering_minus1: [u8; MAX_SUB_LAYERS],
    /// sps_max_num_reorder_pics[i].
    pub max_num_reorder_pics: [u8; MAX_SUB_LAYERS],
    /// sps_max_latency_increase_plus1[i].
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    /// log2_max_pic_order_cnt_lsb_minus4.
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
}

impl SequenceParams {
    /// Checks the constraints of 7.4.3.2.1 that the DPB relies on.
    pub fn validate(&self) -> Result<(), SequenceError> {
        if usize::from(self.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(SequenceError::TooManySubLayers(self.max_sub_layers_minus1));
        }

        for i in 0..=usize::from(self.max_sub_layers_minus1) {
            let buffering = self.max_dec_pic_buffering_minus1[i];
            let reorder = self.max_num_reorder_pics[i];

            if usize::from(buffering) >= MAX_DPB_SIZE {
                return Err(SequenceError::DpbTooLarge(buffering));
            }

            if reorder > buffering {
                return Err(SequenceError::ReorderExceedsBuffering { reorder, buffering });
            }
        }

        if self.log2_max_pic_order_cnt_lsb_minus4 > 12 {
            return Err(SequenceError::PocLsbTooLarge(self.log2_max_pic_order_cnt_lsb_minus4));
        }

        Ok(())
    }

    /// HighestTid, assuming all sub-layers are decoded.
    pub fn highest_tid(&self) -> usize {
        usize::from(self.max_sub_layers_minus1).min(MAX_SUB_LAYERS - 1)
    }

    /// sps_max_dec_pic_buffering_minus1[HighestTid] + 1. This is also the
    /// maximum number of pictures the DPB is configured to hold.
    pub fn max_dec_pic_buffering(&self) -> usize {
        usize::from(self.max_dec_pic_buffering_minus1[self.highest_tid()]) + 1
    }

    /// sps_max_num_reorder_pics[HighestTid].
    pub fn max_num_reorder_pics(&self) -> usize {
        usize::from(self.max_num_reorder_pics[self.highest_tid()])
    }

    /// SpsMaxLatencyPictures[HighestTid], or 0 if no latency limit applies.
    /// See equation 7-9.
    pub fn sps_max_latency_pictures(&self) -> u32 {
        let highest_tid = self.highest_tid();
        let max_latency_increase_plus1 = self.max_latency_increase_plus1[highest_tid];

        if max_latency_increase_plus1 == 0 {
            return 0;
        }

        u32::from(self.max_num_reorder_pics[highest_tid]).saturating_add(max_latency_increase_plus1 - 1)
    }

    /// MaxPicOrderCntLsb. See equation 7-8.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (i32::from(self.log2_max_pic_order_cnt_lsb_minus4.min(12)) + 4)
    }
}
