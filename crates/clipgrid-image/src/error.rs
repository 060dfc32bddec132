// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("could not decode image data: {0}")]
    Decode(String),

    #[error("could not encode image as PNG: {0}")]
    Encode(String),
}
