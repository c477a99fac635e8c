// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    config::Config,
    crypto::{AuthHmac, Sha1Hmac},
    device::{Channel, TpmDevice},
    marshal::TpmResponse,
    room::{KeyRoom, NoRoom},
    TpmError,
};
use std::fmt;

/// A device together with everything needed to talk to it: the HMAC
/// primitive, the configuration and the room-making hook.
pub struct TpmContext {
    device: TpmDevice,
    hmac: Box<dyn AuthHmac>,
    config: Config,
    room: Box<dyn KeyRoom>,
}

impl fmt::Debug for TpmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TpmContext")
            .field("device", &self.device)
            .field("config", &self.config)
            .field("room", &self.room)
            .finish_non_exhaustive()
    }
}

impl TpmContext {
    #[must_use]
    pub fn new(device: TpmDevice, config: Config) -> Self {
        Self {
            device,
            hmac: Box::new(Sha1Hmac),
            config,
            room: Box::new(NoRoom),
        }
    }

    /// Replaces the HMAC primitive.
    #[must_use]
    pub fn with_hmac<H: AuthHmac + 'static>(mut self, hmac: H) -> Self {
        self.hmac = Box::new(hmac);
        self
    }

    /// Replaces the room-making hook.
    #[must_use]
    pub fn with_room<R: KeyRoom + 'static>(mut self, room: R) -> Self {
        self.room = Box::new(room);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &TpmDevice {
        &self.device
    }

    pub fn hmac(&self) -> &dyn AuthHmac {
        self.hmac.as_ref()
    }

    #[must_use]
    pub fn room(&self) -> &dyn KeyRoom {
        self.room.as_ref()
    }

    /// Sends a finished command buffer.
    ///
    /// # Errors
    ///
    /// See [`TpmDevice::execute`].
    pub fn execute(
        &mut self,
        command: &[u8],
        name: &str,
        channel: Channel,
    ) -> Result<TpmResponse, TpmError> {
        self.device.execute(command, name, channel)
    }

    /// Sends a finished command buffer that carries `handles` handles.
    ///
    /// # Errors
    ///
    /// See [`TpmDevice::execute`].
    pub fn execute_with_handles(
        &mut self,
        command: &[u8],
        handles: usize,
        name: &str,
        channel: Channel,
    ) -> Result<TpmResponse, TpmError> {
        self.device
            .execute_with_handles(command, handles, name, channel)
    }

    /// Runs the room-making hook for `key_handle` and returns the handle under
    /// which the key is resident afterwards.
    ///
    /// The hook is detached while it runs, so anything it issues sees
    /// [`NoRoom`] and cannot recurse into it.
    ///
    /// # Errors
    ///
    /// Propagates the hook's error.
    pub fn make_room(&mut self, key_handle: u32) -> Result<u32, TpmError> {
        let mut room = std::mem::replace(&mut self.room, Box::new(NoRoom));
        let result = room.make_room(self, key_handle);
        self.room = room;
        result
    }

    /// Tells the room-making hook that `key_handle` is gone from the device.
    pub(crate) fn forget_key(&mut self, key_handle: u32) {
        self.room.forget(key_handle);
    }
}
