// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Keeping keys resident on a device with few key slots.

use crate::{
    constants::{tpm_rt, TPM_CONTEXT_LABEL_SIZE},
    context::{ContextBlob, Residency},
    TpmContext, TpmError,
};
use log::debug;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

const SWAP_LABEL: &[u8; TPM_CONTEXT_LABEL_SIZE] = b"tpmkey-swap\0\0\0\0\0";

/// Hook run before a command that needs a key loaded on the device.
pub trait KeyRoom: fmt::Debug {
    /// Makes sure `key_handle` is resident and returns the handle it is
    /// resident under.
    ///
    /// Anything issued through `tpm` while this runs bypasses the hook.
    ///
    /// # Errors
    ///
    /// Returns the error of any command issued to make room.
    fn make_room(&mut self, tpm: &mut TpmContext, key_handle: u32) -> Result<u32, TpmError>;

    /// Drops any bookkeeping for a key that left the device.
    fn forget(&mut self, _key_handle: u32) {}
}

/// Assumes every key is resident.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoom;

impl KeyRoom for NoRoom {
    fn make_room(&mut self, _tpm: &mut TpmContext, key_handle: u32) -> Result<u32, TpmError> {
        Ok(key_handle)
    }
}

/// Keeps at most `capacity` tracked keys resident and swaps the least
/// recently used one out to a saved context when another is needed.
#[derive(Debug)]
pub struct KeySwapper {
    capacity: usize,
    /// Least recently used first.
    resident: VecDeque<u32>,
    swapped: HashMap<u32, ContextBlob>,
}

impl KeySwapper {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            resident: VecDeque::new(),
            swapped: HashMap::new(),
        }
    }

    /// Records a key that is resident but was loaded outside of the hook.
    pub fn track(&mut self, key_handle: u32) {
        if !is_permanent(key_handle) && !self.resident.contains(&key_handle) {
            self.resident.push_back(key_handle);
        }
    }

    #[must_use]
    pub fn is_swapped_out(&self, key_handle: u32) -> bool {
        self.swapped.contains_key(&key_handle)
    }

    /// Tracked resident keys, least recently used first.
    #[must_use]
    pub fn resident(&self) -> Vec<u32> {
        self.resident.iter().copied().collect()
    }

    fn touch(&mut self, key_handle: u32) {
        self.resident.retain(|&h| h != key_handle);
        self.resident.push_back(key_handle);
    }

    fn swap_out(&mut self, tpm: &mut TpmContext, keep: u32) -> Result<(), TpmError> {
        let Some(pos) = self.resident.iter().position(|&h| h != keep) else {
            return Ok(());
        };
        let Some(victim) = self.resident.remove(pos) else {
            return Ok(());
        };
        let context = tpm.save_context(victim, tpm_rt::KEY, SWAP_LABEL, Residency::AssumeResident)?;
        tpm.evict_key(victim, Residency::AssumeResident)?;
        debug!(target: "tpmkey::room", "swapped out {victim:#010x}");
        self.swapped.insert(victim, context);
        Ok(())
    }
}

impl KeyRoom for KeySwapper {
    fn make_room(&mut self, tpm: &mut TpmContext, key_handle: u32) -> Result<u32, TpmError> {
        if is_permanent(key_handle) {
            return Ok(key_handle);
        }

        if let Some(context) = self.swapped.remove(&key_handle) {
            while self.resident.len() >= self.capacity {
                if let Err(e) = self.swap_out(tpm, key_handle) {
                    self.swapped.insert(key_handle, context);
                    return Err(e);
                }
            }
            let handle = match tpm.load_context(key_handle, true, &context) {
                Ok(handle) => handle,
                Err(e) => {
                    self.swapped.insert(key_handle, context);
                    return Err(e);
                }
            };
            debug!(target: "tpmkey::room", "swapped in {key_handle:#010x} as {handle:#010x}");
            self.resident.push_back(handle);
            return Ok(handle);
        }

        self.touch(key_handle);
        while self.resident.len() > self.capacity {
            self.swap_out(tpm, key_handle)?;
        }
        Ok(key_handle)
    }

    fn forget(&mut self, key_handle: u32) {
        self.resident.retain(|&h| h != key_handle);
        self.swapped.remove(&key_handle);
    }
}

/// Handles such as the SRK never leave the device.
fn is_permanent(handle: u32) -> bool {
    handle >> 24 == 0x40
}
