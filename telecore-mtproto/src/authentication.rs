//! Sans-IO authorization key generation.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = authentication::step1();
//! // send req, receive resp
//! let (req, s2) = authentication::step2(&ctx, s1, resp)?;
//! // send req, receive resp
//! let (req, s3) = authentication::step3(&ctx, s2, resp)?;
//! // send req, receive resp
//! let done = authentication::finish(s3, resp)?;
//! // done.auth_key is ready
//! ```
//!
//! Every step validates what the server sent and fails hard on the first
//! mismatch; the caller is expected to drop the socket and try again later.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use telecore_crypto::rsa::{self, PublicKeyRegistry};
use telecore_crypto::{AuthKey, aes, factorize, fill_random, generate_key_data_from_nonce, sha1};
use telecore_tl::mtproto::{
    ClientDhInnerData, PQInnerDataDc, PQInnerDataTempDc, ReqDhParams, ReqPqMulti, ResPq,
    ServerDhInnerData, ServerDhParams, SetClientDhParams, SetClientDhParamsAnswer,
};
use telecore_tl::{Cursor, Deserializable, Serializable};

use crate::dh_prime::DhPrimeCache;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce         { got: [u8; 16], expected: [u8; 16] },
    InvalidServerNonce   { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize        { size: usize },
    Factorization        { pq: u64 },
    UnknownFingerprints  { fingerprints: Vec<i64> },
    InnerDataTooLarge    { len: usize },
    DhParamsFail,
    EncryptedResponseNotPadded { len: usize },
    InvalidAnswerPadding { len: usize },
    InvalidDhInnerData   { error: telecore_tl::deserialize::Error },
    InvalidAnswerHash    { got: [u8; 20], expected: [u8; 20] },
    InvalidDhPrimeLength { bits: u64 },
    InvalidGenerator     { g: i32 },
    GeneratorNotResidue  { g: i32 },
    UnsafeDhPrime,
    GParameterOutOfRange { value: BigUint, low: BigUint, high: BigUint },
    DhGenRetry,
    DhGenFail,
    InvalidNewNonceHash  { got: [u8; 16], expected: [u8; 16] },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected }
                => write!(f, "nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidServerNonce { got, expected }
                => write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidPqSize { size }
                => write!(f, "pq size {size} invalid (expected 8)"),
            Self::Factorization { pq }
                => write!(f, "could not factorize pq={pq}"),
            Self::UnknownFingerprints { fingerprints }
                => write!(f, "no known fingerprint in {fingerprints:?}"),
            Self::InnerDataTooLarge { len }
                => write!(f, "p_q_inner_data of {len} bytes does not fit one RSA block"),
            Self::DhParamsFail
                => write!(f, "server returned DH params failure"),
            Self::EncryptedResponseNotPadded { len }
                => write!(f, "encrypted answer len {len} is not 16-byte aligned"),
            Self::InvalidAnswerPadding { len }
                => write!(f, "encrypted answer carries {len} bytes of padding"),
            Self::InvalidDhInnerData { error }
                => write!(f, "DH inner data deserialization error: {error}"),
            Self::InvalidAnswerHash { got, expected }
                => write!(f, "answer hash mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidDhPrimeLength { bits }
                => write!(f, "dh_prime has {bits} bits (expected 2048)"),
            Self::InvalidGenerator { g }
                => write!(f, "generator g={g} not in 2..=7"),
            Self::GeneratorNotResidue { g }
                => write!(f, "dh_prime does not satisfy the residue condition for g={g}"),
            Self::UnsafeDhPrime
                => write!(f, "dh_prime or (dh_prime-1)/2 is not prime"),
            Self::GParameterOutOfRange { value, low, high }
                => write!(f, "g={value} not in range ({low}, {high})"),
            Self::DhGenRetry  => write!(f, "DH gen retry requested"),
            Self::DhGenFail   => write!(f, "DH gen failed"),
            Self::InvalidNewNonceHash { got, expected }
                => write!(f, "new nonce hash mismatch: got {got:?}, expected {expected:?}"),
        }
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Inputs shared by all steps of one handshake.
#[derive(Clone, Debug)]
pub struct HandshakeContext {
    /// Data-center id as encoded in `p_q_inner_data_dc`.
    pub dc_id: i32,
    /// Lifetime of a temporary key in seconds; 0 asks for a permanent key.
    pub expires_in: i32,
    pub keys: Arc<PublicKeyRegistry>,
    pub primes: Arc<DhPrimeCache>,
}

impl HandshakeContext {
    pub fn new(dc_id: i32, keys: Arc<PublicKeyRegistry>, primes: Arc<DhPrimeCache>) -> Self {
        Self { dc_id, expires_in: 0, keys, primes }
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
#[derive(Debug)]
pub struct Step1 { nonce: [u8; 16] }

/// State after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    expires_in:   i32,
}

/// State after step 3.
#[derive(Debug)]
pub struct Step3 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    gab:          BigUint,
    time_offset:  i32,
    expires_at:   Option<i64>,
}

/// The final output of a successful auth key handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    pub auth_key:    AuthKey,
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// Initial server salt.
    pub first_salt:  i64,
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Generate a `req_pq_multi` request. Returns the request + opaque state.
pub fn step1() -> (ReqPqMulti, Step1) {
    let mut nonce = [0u8; 16];
    fill_random(&mut nonce);
    do_step1(&nonce)
}

fn do_step1(random: &[u8; 16]) -> (ReqPqMulti, Step1) {
    let nonce = *random;
    (ReqPqMulti { nonce }, Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `ResPQ` and generate `req_DH_params`.
pub fn step2(ctx: &HandshakeContext, data: Step1, response: ResPq) -> Result<(ReqDhParams, Step2), Error> {
    let mut new_nonce = [0u8; 32];
    fill_random(&mut new_nonce);
    let mut padding = [0u8; 255];
    fill_random(&mut padding);
    do_step2(ctx, data, response, &new_nonce, &padding)
}

fn do_step2(
    ctx:       &HandshakeContext,
    data:      Step1,
    res_pq:    ResPq,
    new_nonce: &[u8; 32],
    padding:   &[u8; 255],
) -> Result<(ReqDhParams, Step2), Error> {
    let Step1 { nonce } = data;
    check_nonce(&res_pq.nonce, &nonce)?;

    let pq_bytes: [u8; 8] = res_pq.pq.as_slice().try_into()
        .map_err(|_| Error::InvalidPqSize { size: res_pq.pq.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = factorize(pq).ok_or(Error::Factorization { pq })?;

    let (fingerprint, key) = ctx.keys.find(&res_pq.server_public_key_fingerprints)
        .ok_or_else(|| Error::UnknownFingerprints {
            fingerprints: res_pq.server_public_key_fingerprints.clone(),
        })?;

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);
    let new_nonce = *new_nonce;

    let inner = if ctx.expires_in > 0 {
        PQInnerDataTempDc {
            pq: res_pq.pq.clone(),
            p: p_bytes.clone(),
            q: q_bytes.clone(),
            nonce,
            server_nonce: res_pq.server_nonce,
            new_nonce,
            dc: ctx.dc_id,
            expires_in: ctx.expires_in,
        }.to_bytes()
    } else {
        PQInnerDataDc {
            pq: res_pq.pq.clone(),
            p: p_bytes.clone(),
            q: q_bytes.clone(),
            nonce,
            server_nonce: res_pq.server_nonce,
            new_nonce,
            dc: ctx.dc_id,
        }.to_bytes()
    };

    let encrypted_data = rsa::encrypt_hashed_with(&inner, key, padding)
        .ok_or(Error::InnerDataTooLarge { len: inner.len() })?;

    log::debug!("[auth] step2: pq={pq} factorized, using key {fingerprint}");

    Ok((
        ReqDhParams {
            nonce,
            server_nonce: res_pq.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data,
        },
        Step2 { nonce, server_nonce: res_pq.server_nonce, new_nonce, expires_in: ctx.expires_in },
    ))
}

fn trim_be(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `ServerDhParams` and generate `set_client_DH_params`.
pub fn step3(
    ctx:      &HandshakeContext,
    data:     Step2,
    response: ServerDhParams,
) -> Result<(SetClientDhParams, Step3), Error> {
    let mut rnd = [0u8; 272]; // 256 for DH b, 16 for padding
    fill_random(&mut rnd);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    do_step3(ctx, data, response, &rnd, now)
}

fn do_step3(
    ctx:      &HandshakeContext,
    data:     Step2,
    response: ServerDhParams,
    random:   &[u8; 272],
    now:      i64,
) -> Result<(SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce, expires_in } = data;

    let mut server_dh_ok = match response {
        ServerDhParams::Fail(f) => {
            check_nonce(&f.nonce, &nonce)?;
            check_server_nonce(&f.server_nonce, &server_nonce)?;
            let digest = sha1!(new_nonce);
            let mut expected_hash = [0u8; 16];
            expected_hash.copy_from_slice(&digest[4..]);
            check_new_nonce_hash(&f.new_nonce_hash, &expected_hash)?;
            return Err(Error::DhParamsFail);
        }
        ServerDhParams::Ok(x) => x,
    };

    check_nonce(&server_dh_ok.nonce, &nonce)?;
    check_server_nonce(&server_dh_ok.server_nonce, &server_nonce)?;

    let answer_len = server_dh_ok.encrypted_answer.len();
    if answer_len % 16 != 0 || answer_len < 20 {
        return Err(Error::EncryptedResponseNotPadded { len: answer_len });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut server_dh_ok.encrypted_answer, &key, &iv);
    let plain = server_dh_ok.encrypted_answer;

    let mut got_hash = [0u8; 20];
    got_hash.copy_from_slice(&plain[..20]);
    let mut cursor = Cursor::from_slice(&plain[20..]);

    let inner = ServerDhInnerData::deserialize(&mut cursor)
        .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = sha1!(&plain[20..20 + cursor.pos()]);
    if got_hash != expected_hash {
        return Err(Error::InvalidAnswerHash { got: got_hash, expected: expected_hash });
    }
    if cursor.remaining() >= 16 {
        return Err(Error::InvalidAnswerPadding { len: cursor.remaining() });
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    ctx.primes.check(&inner.dh_prime, inner.g)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    let g = BigUint::from(inner.g as u32);
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    let time_offset = (inner.server_time as i64 - now) as i32;

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);

    let one = BigUint::from(1u32);
    check_g_in_range(&g,   &one, &(&dh_prime - &one))?;
    check_g_in_range(&g_a, &one, &(&dh_prime - &one))?;
    check_g_in_range(&g_b, &one, &(&dh_prime - &one))?;
    let safety = one.clone() << (2048 - 64);
    check_g_in_range(&g_a, &safety, &(&dh_prime - &safety))?;
    check_g_in_range(&g_b, &safety, &(&dh_prime - &safety))?;

    let gab = g_a.modpow(&b, &dh_prime);

    let client_dh_inner = ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id: 0,
        g_b: g_b.to_bytes_be(),
    }.to_bytes();

    let digest = sha1!(&client_dh_inner);
    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;

    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&digest);
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut hashed, &key, &iv);

    let expires_at = (expires_in > 0).then(|| inner.server_time as i64 + expires_in as i64);

    Ok((
        SetClientDhParams { nonce, server_nonce, encrypted_data: hashed },
        Step3 { nonce, server_nonce, new_nonce, gab, time_offset, expires_at },
    ))
}

// ─── finish: create_key ──────────────────────────────────────────────────────

/// Finalise the handshake. Returns the ready [`Finished`] on success.
pub fn finish(data: Step3, response: SetClientDhParamsAnswer) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset, expires_at } = data;

    let (answer_nonce, answer_server_nonce, hash, num) = match response {
        SetClientDhParamsAnswer::Ok(x)    => (x.nonce, x.server_nonce, x.new_nonce_hash1, 1),
        SetClientDhParamsAnswer::Retry(x) => (x.nonce, x.server_nonce, x.new_nonce_hash2, 2),
        SetClientDhParamsAnswer::Fail(x)  => (x.nonce, x.server_nonce, x.new_nonce_hash3, 3),
    };

    check_nonce(&answer_nonce, &nonce)?;
    check_server_nonce(&answer_server_nonce, &server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    let skip = 256 - gab_bytes.len();
    key_bytes[skip..].copy_from_slice(&gab_bytes);

    let mut auth_key = AuthKey::from_bytes(key_bytes);
    let expected_hash = auth_key.calc_new_nonce_hash(&new_nonce, num);
    check_new_nonce_hash(&hash, &expected_hash)?;

    let first_salt = {
        let mut buf = [0u8; 8];
        for ((dst, a), b) in buf.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
            *dst = a ^ b;
        }
        i64::from_le_bytes(buf)
    };

    if let Some(at) = expires_at {
        auth_key = auth_key.with_expiry(at);
    }

    match num {
        1 => Ok(Finished { auth_key, time_offset, first_salt }),
        2 => Err(Error::DhGenRetry),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}
fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}
fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNewNonceHash { got: *got, expected: *expected })
    }
}
fn check_g_in_range(val: &BigUint, lo: &BigUint, hi: &BigUint) -> Result<(), Error> {
    if lo < val && val < hi { Ok(()) } else {
        Err(Error::GParameterOutOfRange { value: val.clone(), low: lo.clone(), high: hi.clone() })
    }
}
