// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer management for H.265 decoders.
//!
//! [`codec::h265::dpb::Dpb`] stores decoded pictures and implements the
//! output "bumping" process of Annex C.5.2, while
//! [`decoder::h265::DpbManager`] runs the per-picture processes around it: POC
//! derivation, reference picture set marking, and output of pictures before
//! and after each picture is decoded.

pub mod codec;
pub mod decoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
