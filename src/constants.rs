// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! TPM 1.2 wire constants.

pub const TPM_HEADER_SIZE: usize = 10;
pub const TPM_MAX_COMMAND_SIZE: usize = 4096;

pub const TPM_U32_SIZE: usize = 4;
pub const TPM_DIGEST_SIZE: usize = 20;
pub const TPM_NONCE_SIZE: usize = 20;
pub const TPM_CONTEXT_LABEL_SIZE: usize = 16;

/// Size of an authorization trailer in a request: handle, nonce, continue, auth.
pub const TPM_AUTH_REQUEST_SIZE: usize = TPM_U32_SIZE + TPM_NONCE_SIZE + 1 + TPM_DIGEST_SIZE;
/// Size of an authorization trailer in a response: nonce, continue, auth.
pub const TPM_AUTH_RESPONSE_SIZE: usize = TPM_NONCE_SIZE + 1 + TPM_DIGEST_SIZE;

/// Number of PCRs covered by the standard selection mask.
pub const TPM_NUM_PCR: usize = 24;
/// Width of the standard selection mask in bytes.
pub const TPM_PCR_SELECT_SIZE: usize = TPM_NUM_PCR / 8;

pub mod tpm_tag {
    pub const RQU_COMMAND: u16 = 0x00C1;
    pub const RQU_AUTH1_COMMAND: u16 = 0x00C2;
    pub const RQU_AUTH2_COMMAND: u16 = 0x00C3;
    pub const RSP_COMMAND: u16 = 0x00C4;
    pub const RSP_AUTH1_COMMAND: u16 = 0x00C5;
    pub const RSP_AUTH2_COMMAND: u16 = 0x00C6;

    pub const PCR_INFO_LONG: u16 = 0x0006;
    pub const TRANSPORT_LOG_IN: u16 = 0x0010;
    pub const TRANSPORT_LOG_OUT: u16 = 0x0011;
    pub const CURRENT_TICKS: u16 = 0x0014;
}

pub mod tpm_ord {
    pub const OIAP: u32 = 0x0000_000A;
    pub const OSAP: u32 = 0x0000_000B;
    pub const DSAP: u32 = 0x0000_0011;
    pub const UNSEAL: u32 = 0x0000_0018;
    pub const EVICT_KEY: u32 = 0x0000_0022;
    pub const TERMINATE_HANDLE: u32 = 0x0000_0096;
    pub const SAVE_CONTEXT: u32 = 0x0000_00B8;
    pub const LOAD_CONTEXT: u32 = 0x0000_00B9;
    pub const FLUSH_SPECIFIC: u32 = 0x0000_00BA;
    pub const NV_READ_VALUE: u32 = 0x0000_00CF;
}

pub mod tpm_et {
    pub const KEYHANDLE: u16 = 0x0001;
    pub const OWNER: u16 = 0x0002;
    pub const SRK: u16 = 0x0004;
    pub const DEL_OWNER_BLOB: u16 = 0x0007;
    pub const DEL_KEY_BLOB: u16 = 0x0009;
}

pub mod tpm_rt {
    pub const KEY: u32 = 0x0000_0001;
    pub const AUTH: u32 = 0x0000_0002;
}

pub mod tpm_kh {
    pub const SRK: u32 = 0x4000_0000;
    pub const OWNER: u32 = 0x4000_0001;
}

/// Device return codes used by this crate.
pub mod tpm_rc {
    pub const AUTHFAIL: u32 = 0x0000_0001;
    pub const BADINDEX: u32 = 0x0000_0002;
    pub const BAD_PARAMETER: u32 = 0x0000_0003;
    pub const BAD_ORDINAL: u32 = 0x0000_000A;
    pub const INVALID_KEYHANDLE: u32 = 0x0000_000C;
    pub const AUTH2FAIL: u32 = 0x0000_001D;
    pub const BAD_PARAM_SIZE: u32 = 0x0000_0019;
    pub const INVALID_AUTHHANDLE: u32 = 0x0000_0022;
    pub const BADTAG: u32 = 0x0000_001E;
    pub const RESOURCES: u32 = 0x0000_0015;
    pub const BADCONTEXT: u32 = 0x0000_005A;
    pub const NON_FATAL: u32 = 0x0000_0800;
}
