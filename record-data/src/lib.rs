// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

pub mod access;
pub mod canonical;
pub mod codec;
pub mod did;
pub mod envelope;
pub mod queue;
pub mod record;
pub mod registry;
pub mod soul;
pub mod template;
