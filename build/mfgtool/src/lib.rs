// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composes the separately built firmware targets of a board, plus any raw
//! data files, into per-device flash images suitable for factory
//! programming.

pub mod blob;
pub mod builder;
pub mod definition;
pub mod emit;
pub mod error;
pub mod flash;
pub mod hash;
pub mod meta;
pub mod overlap;
pub mod part;
pub mod project;
pub mod sign;
pub mod validate;

pub use builder::{MfgBuilder, MfgImage};
pub use definition::Definition;
pub use emit::{MfgEmitter, MfgManifest};
pub use error::MfgError;
pub use flash::{FlashArea, FlashMap};
pub use project::Project;
