// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the start-code-delimited metadata units of an MPEG-2 video
//! elementary stream (ISO/IEC 13818-2), ahead of macroblock decoding by a
//! hardware or software decoder.
//!
//! The client is expected to split the stream into units separated by start
//! codes and hand each unit to the parser. The client owns the decision of
//! whether partially received units are worth submitting; the parser only
//! guarantees it fails cleanly on them.

pub mod bitstream_utils;
pub mod codec;
