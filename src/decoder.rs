// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The processes a decoder runs around the DPB for every picture.

pub mod h265;

use std::collections::VecDeque;

use thiserror::Error;

use crate::codec::h265::sequence::SequenceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid sequence parameters: {0}")]
    InvalidSequence(#[from] SequenceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A queue where output pictures wait until they are retrieved by the client.
struct ReadyFramesQueue<T> {
    /// Queue of all the frames waiting to be sent to the client.
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    /// Push `handle` to the back of the queue.
    fn push(&mut self, handle: T) {
        self.queue.push_back(handle)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it.
impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = T;

    /// Returns the next frame (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}
