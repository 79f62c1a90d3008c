// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Handshake-adjacent wire formats: transport parameters and version
//! information

pub mod parameters;
pub mod version_info;
