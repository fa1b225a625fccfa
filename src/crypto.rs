use serde::Deserialize;

/// RSA public key as served by the CAS `getPubKey` endpoint.
/// Both fields are big-endian hex strings.
#[derive(Debug, Clone, Deserialize)]
pub struct PublicKey {
    pub modulus: String,
    pub exponent: String,
}

#[derive(Debug)]
pub enum CryptoError {
    /// The secret contains bytes outside the ASCII range; the server-side
    /// decryption assumes one byte per character.
    NonAsciiSecret,
    /// Modulus or exponent is not a valid hex integer.
    BadKey(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::NonAsciiSecret => write!(f, "secret contains non-ASCII bytes"),
            CryptoError::BadKey(field) => write!(f, "public key field '{}' is not valid hex", field),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Encrypts `secret` the way the portal's login page does in the browser:
/// raw bytes as a big-endian integer M, C = M^E mod N, rendered as lowercase
/// hex left-padded to the key's byte width. No PKCS padding is applied; the
/// server decrypts with the same raw-integer convention, so this must stay
/// bit-exact.
pub fn encrypt(secret: &str, key: &PublicKey) -> Result<String, CryptoError> {
    if !secret.is_ascii() {
        return Err(CryptoError::NonAsciiSecret);
    }
    let n = parse_hex(&key.modulus).ok_or_else(|| CryptoError::BadKey("modulus".into()))?;
    if n.is_empty() {
        return Err(CryptoError::BadKey("modulus".into()));
    }
    let e = parse_hex(&key.exponent).ok_or_else(|| CryptoError::BadKey("exponent".into()))?;
    let m = from_be_bytes(secret.as_bytes());

    let c = mod_pow(&m, &e, &n);

    // Pad to the modulus byte length: a 512-bit key yields 128 hex chars.
    let width = 2 * ((bit_len(&n) + 7) / 8);
    let mut out = to_hex(&c);
    while out.len() < width {
        out.insert(0, '0');
    }
    Ok(out)
}

// Minimal unsigned bignum on little-endian u32 limbs. Key sizes here are
// 512-bit, so schoolbook multiplication and bitwise reduction are plenty.

type Limbs = Vec<u32>;

fn trim(mut v: Limbs) -> Limbs {
    while v.last() == Some(&0) {
        v.pop();
    }
    v
}

fn parse_hex(s: &str) -> Option<Limbs> {
    let s = s.trim();
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut limbs = Vec::with_capacity(s.len() / 8 + 1);
    let bytes = s.as_bytes();
    let mut end = bytes.len();
    while end > 0 {
        let start = end.saturating_sub(8);
        let chunk = std::str::from_utf8(&bytes[start..end]).ok()?;
        limbs.push(u32::from_str_radix(chunk, 16).ok()?);
        end = start;
    }
    Some(trim(limbs))
}

fn from_be_bytes(bytes: &[u8]) -> Limbs {
    let mut limbs = vec![0u32; (bytes.len() + 3) / 4];
    for (i, &b) in bytes.iter().rev().enumerate() {
        limbs[i / 4] |= (b as u32) << (8 * (i % 4));
    }
    trim(limbs)
}

fn bit_len(v: &Limbs) -> usize {
    match v.last() {
        Some(&top) => 32 * (v.len() - 1) + (32 - top.leading_zeros() as usize),
        None => 0,
    }
}

fn get_bit(v: &Limbs, i: usize) -> bool {
    let limb = i / 32;
    limb < v.len() && (v[limb] >> (i % 32)) & 1 == 1
}

/// Compares two trimmed limb vectors.
fn cmp(a: &Limbs, b: &Limbs) -> std::cmp::Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for i in (0..a.len()).rev() {
        if a[i] != b[i] {
            return a[i].cmp(&b[i]);
        }
    }
    std::cmp::Ordering::Equal
}

/// a -= b, assuming a >= b.
fn sub_assign(a: &mut Limbs, b: &Limbs) {
    let mut borrow = 0i64;
    for i in 0..a.len() {
        let rhs = *b.get(i).unwrap_or(&0) as i64;
        let mut diff = a[i] as i64 - rhs - borrow;
        if diff < 0 {
            diff += 1 << 32;
            borrow = 1;
        } else {
            borrow = 0;
        }
        a[i] = diff as u32;
    }
    while a.last() == Some(&0) {
        a.pop();
    }
}

fn mul(a: &Limbs, b: &Limbs) -> Limbs {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u32; a.len() + b.len()];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u64;
        for (j, &y) in b.iter().enumerate() {
            let t = out[i + j] as u64 + x as u64 * y as u64 + carry;
            out[i + j] = t as u32;
            carry = t >> 32;
        }
        out[i + b.len()] = carry as u32;
    }
    trim(out)
}

/// a mod n by bitwise long division. n must be non-empty.
fn rem(a: &Limbs, n: &Limbs) -> Limbs {
    if cmp(a, n) == std::cmp::Ordering::Less {
        return a.clone();
    }
    let mut r: Limbs = Vec::new();
    for i in (0..bit_len(a)).rev() {
        // r = (r << 1) | bit(a, i)
        let mut carry = if get_bit(a, i) { 1u32 } else { 0 };
        for limb in r.iter_mut() {
            let shifted = (*limb as u64) << 1 | carry as u64;
            *limb = shifted as u32;
            carry = (shifted >> 32) as u32;
        }
        if carry != 0 {
            r.push(carry);
        }
        if cmp(&r, n) != std::cmp::Ordering::Less {
            sub_assign(&mut r, n);
        }
    }
    r
}

fn mod_pow(base: &Limbs, exp: &Limbs, n: &Limbs) -> Limbs {
    if n.len() == 1 && n[0] == 1 {
        return Vec::new();
    }
    let base = rem(base, n);
    let mut result: Limbs = vec![1];
    for i in (0..bit_len(exp)).rev() {
        result = rem(&mul(&result, &result), n);
        if get_bit(exp, i) {
            result = rem(&mul(&result, &base), n);
        }
    }
    result
}

fn to_hex(v: &Limbs) -> String {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for &limb in v.iter().rev() {
        bytes.extend_from_slice(&limb.to_be_bytes());
    }
    let s = hex::encode(bytes);
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
