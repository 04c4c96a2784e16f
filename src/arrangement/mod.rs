// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Song structure system.
//!
//! This module provides:
//! - Parts: Bar ranges bound to one rhythm
//! - SongStructure: The transactional, undoable list of parts
//! - SgsUpdater: Lead sheet to song structure translation

pub mod part;
pub mod structure;
pub mod updater;

pub use part::{Part, PartId};
pub use structure::{ChangeProposal, SgsChange, SgsChangeListener, SongStructure, StructureEdit};
pub use updater::{SgsUpdater, UpdaterState};
