// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use hmac::{Hmac, Mac};
use rstest::rstest;
use sha1::{Digest, Sha1};
use tpmkey::{
    auth::{split_response, verify_response, AuthCommand},
    constants::{tpm_ord, tpm_tag},
    crypto::Sha1Hmac,
    marshal::TpmResponse,
    session::{EntityBinding, Session, SessionState},
    TpmError,
};

const KEY_SECRET: [u8; 20] = [0x11; 20];
const DATA_SECRET: [u8; 20] = [0x22; 20];
const KEY_EVEN: [u8; 20] = [0x33; 20];
const DATA_EVEN: [u8; 20] = [0x44; 20];
const ODD_1: [u8; 20] = [0x55; 20];
const ODD_2: [u8; 20] = [0x66; 20];

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; 20] {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).unwrap();
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn oiap(handle: u32, secret: [u8; 20], even_nonce: [u8; 20]) -> Session {
    Session::Oiap(SessionState {
        handle,
        secret,
        even_nonce,
    })
}

fn osap(handle: u32, secret: [u8; 20], even_nonce: [u8; 20]) -> Session {
    Session::Osap(
        SessionState {
            handle,
            secret,
            even_nonce,
        },
        EntityBinding {
            entity_type: 1,
            entity_handle: 0x0100_0000,
        },
    )
}

fn unseal_command() -> AuthCommand {
    let mut cmd = AuthCommand::new(tpm_ord::UNSEAL);
    cmd.add_handle(0x0100_0000).add_bytes(b"sealed blob");
    cmd
}

struct Trailer {
    secret: [u8; 20],
    new_even: [u8; 20],
    odd: [u8; 20],
    continue_session: bool,
}

/// Builds a response the way a device would.
fn device_response(rc: u32, ordinal: u32, params: &[u8], trailers: &[Trailer]) -> TpmResponse {
    let tag = match trailers.len() {
        1 => tpm_tag::RSP_AUTH1_COMMAND,
        _ => tpm_tag::RSP_AUTH2_COMMAND,
    };
    let out_digest = sha1(&[&rc.to_be_bytes(), &ordinal.to_be_bytes(), params]);
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&tag.to_be_bytes());
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&rc.to_be_bytes());
    bytes.extend_from_slice(params);
    for t in trailers {
        let cont = [u8::from(t.continue_session)];
        let auth = hmac_sha1(&t.secret, &[&out_digest, &t.new_even, &t.odd, &cont]);
        bytes.extend_from_slice(&t.new_even);
        bytes.extend_from_slice(&cont);
        bytes.extend_from_slice(&auth);
    }
    let size = u32::try_from(bytes.len()).unwrap();
    bytes[2..6].copy_from_slice(&size.to_be_bytes());
    TpmResponse::parse(bytes).unwrap()
}

fn unseal_params() -> Vec<u8> {
    let mut params = 6u32.to_be_bytes().to_vec();
    params.extend_from_slice(b"secret");
    params
}

#[test]
fn test_param_digest_excludes_handles() {
    let cmd = unseal_command();
    let expected = sha1(&[&tpm_ord::UNSEAL.to_be_bytes(), b"sealed blob"]);
    assert_eq!(cmd.param_digest(), expected);
}

#[test]
fn test_auth1_request_layout() {
    let cmd = unseal_command();
    let session = oiap(0x0200_0000, DATA_SECRET, DATA_EVEN);
    let block = cmd.authorize(&Sha1Hmac, &session, ODD_1).unwrap();
    let expected = hmac_sha1(
        &DATA_SECRET,
        &[&cmd.param_digest(), &DATA_EVEN, &ODD_1, &[0]],
    );
    assert_eq!(block.auth, expected);

    let bytes = cmd.build(&[block]).unwrap();
    assert_eq!(&bytes[0..2], &tpm_tag::RQU_AUTH1_COMMAND.to_be_bytes());
    assert_eq!(&bytes[2..6], &u32::try_from(bytes.len()).unwrap().to_be_bytes());
    assert_eq!(&bytes[6..10], &tpm_ord::UNSEAL.to_be_bytes());
    assert_eq!(&bytes[10..14], &0x0100_0000u32.to_be_bytes());
    assert_eq!(&bytes[14..25], b"sealed blob");
    let trailer = &bytes[25..];
    assert_eq!(trailer.len(), 45);
    assert_eq!(&trailer[0..4], &0x0200_0000u32.to_be_bytes());
    assert_eq!(&trailer[4..24], &ODD_1);
    assert_eq!(trailer[24], 0);
    assert_eq!(&trailer[25..45], &expected);
}

#[test]
fn test_auth2_request_orders_key_block_first() {
    let cmd = unseal_command();
    let key = osap(0x0200_0000, KEY_SECRET, KEY_EVEN);
    let data = oiap(0x0200_0001, DATA_SECRET, DATA_EVEN);
    let key_block = cmd.authorize(&Sha1Hmac, &key, ODD_1).unwrap();
    let data_block = cmd.authorize(&Sha1Hmac, &data, ODD_2).unwrap();
    let bytes = cmd.build(&[key_block, data_block]).unwrap();
    assert_eq!(&bytes[0..2], &tpm_tag::RQU_AUTH2_COMMAND.to_be_bytes());
    let trailers = &bytes[bytes.len() - 90..];
    assert_eq!(&trailers[0..4], &0x0200_0000u32.to_be_bytes());
    assert_eq!(&trailers[45..49], &0x0200_0001u32.to_be_bytes());
}

#[test]
fn test_build_rejects_three_blocks() {
    let cmd = unseal_command();
    let session = oiap(1, DATA_SECRET, DATA_EVEN);
    let block = cmd.authorize(&Sha1Hmac, &session, ODD_1).unwrap();
    assert!(matches!(
        cmd.build(&[block.clone(), block.clone(), block]),
        Err(TpmError::Protocol(_))
    ));
}

#[test]
fn test_auth1_response_verifies_and_rolls_nonce() {
    let params = unseal_params();
    let new_even = [0x77; 20];
    let response = device_response(
        0,
        tpm_ord::UNSEAL,
        &params,
        &[Trailer {
            secret: DATA_SECRET,
            new_even,
            odd: ODD_1,
            continue_session: false,
        }],
    );
    let mut session = oiap(1, DATA_SECRET, DATA_EVEN);
    let out = verify_response(
        &Sha1Hmac,
        tpm_ord::UNSEAL,
        &response,
        &mut [&mut session],
        &[ODD_1],
    )
    .unwrap();
    assert_eq!(out, params);
    assert_eq!(session.state().even_nonce, new_even);
}

#[derive(Debug, Clone, Copy)]
enum Flip {
    Secret,
    EvenNonce,
    OddNonce,
    Ordinal,
    Params,
}

#[rstest]
#[case(Flip::Secret)]
#[case(Flip::EvenNonce)]
#[case(Flip::OddNonce)]
#[case(Flip::Ordinal)]
#[case(Flip::Params)]
fn test_auth1_bit_flip_fails(#[case] flip: Flip) {
    let mut secret = DATA_SECRET;
    let new_even = [0x77; 20];
    let mut odd = ODD_1;
    let mut ordinal = tpm_ord::UNSEAL;
    let params = unseal_params();
    match flip {
        Flip::Secret => secret[0] ^= 1,
        Flip::OddNonce => odd[19] ^= 0x80,
        Flip::Ordinal => ordinal ^= 1,
        Flip::EvenNonce | Flip::Params => {}
    }
    let mut response = device_response(
        0,
        ordinal,
        &params,
        &[Trailer {
            secret,
            new_even,
            odd,
            continue_session: false,
        }],
    );
    match flip {
        Flip::EvenNonce => {
            let at = response.bytes.len() - 41;
            response.bytes[at] ^= 1;
        }
        Flip::Params => response.bytes[14] ^= 1,
        _ => {}
    }

    let mut session = oiap(1, DATA_SECRET, DATA_EVEN);
    let result = verify_response(
        &Sha1Hmac,
        tpm_ord::UNSEAL,
        &response,
        &mut [&mut session],
        &[ODD_1],
    );
    assert!(matches!(result, Err(TpmError::AuthFailed)), "{flip:?}");
    assert_eq!(session.state().even_nonce, DATA_EVEN);
}

fn auth2_response(swap: bool) -> TpmResponse {
    let key = Trailer {
        secret: KEY_SECRET,
        new_even: [0x01; 20],
        odd: ODD_1,
        continue_session: false,
    };
    let data = Trailer {
        secret: DATA_SECRET,
        new_even: [0x02; 20],
        odd: ODD_2,
        continue_session: false,
    };
    let trailers = if swap { [data, key] } else { [key, data] };
    device_response(0, tpm_ord::UNSEAL, &unseal_params(), &trailers)
}

#[test]
fn test_auth2_response_verifies() {
    let mut key = osap(1, KEY_SECRET, KEY_EVEN);
    let mut data = oiap(2, DATA_SECRET, DATA_EVEN);
    let out = verify_response(
        &Sha1Hmac,
        tpm_ord::UNSEAL,
        &auth2_response(false),
        &mut [&mut key, &mut data],
        &[ODD_1, ODD_2],
    )
    .unwrap();
    assert_eq!(out, unseal_params());
    assert_eq!(key.state().even_nonce, [0x01; 20]);
    assert_eq!(data.state().even_nonce, [0x02; 20]);
}

#[test]
fn test_auth2_swapped_blocks_fail() {
    let mut key = osap(1, KEY_SECRET, KEY_EVEN);
    let mut data = oiap(2, DATA_SECRET, DATA_EVEN);
    let result = verify_response(
        &Sha1Hmac,
        tpm_ord::UNSEAL,
        &auth2_response(true),
        &mut [&mut key, &mut data],
        &[ODD_1, ODD_2],
    );
    assert!(matches!(result, Err(TpmError::AuthFailed)));
    assert_eq!(key.state().even_nonce, KEY_EVEN);
    assert_eq!(data.state().even_nonce, DATA_EVEN);
}

#[test]
fn test_response_tag_must_match_session_count() {
    let response = auth2_response(false);
    assert!(matches!(
        split_response(&response, 1),
        Err(TpmError::Protocol(_))
    ));
    let (params, blocks) = split_response(&response, 2).unwrap();
    assert_eq!(params, unseal_params().as_slice());
    assert_eq!(blocks.len(), 2);
}
