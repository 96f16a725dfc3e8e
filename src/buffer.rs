//! Helpers for byte ranges copied out of an image: string decoding, hashing and entropy.

use md5::{Md5, Digest};

use sha1::Sha1;

use sha2::Sha256;

use widestring::U16String;

/// Get the part of ```data``` before its first zero byte, or ```None``` if it has no zero byte.
pub fn zero_terminated(data: &[u8]) -> Option<&[u8]> {
    data.iter()
        .position(|&x| x == 0)
        .map(|p| &data[..p])
}

/// Decode a zero-padded ASCII field, such as a section name, stopping at the first zero byte.
pub fn padded_string(data: &[u8]) -> String {
    let bytes = zero_terminated(data).unwrap_or(data);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode little-endian UTF-16 bytes. A trailing odd byte is ignored and invalid surrogates are replaced.
pub fn utf16_string(data: &[u8]) -> String {
    let units = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect::<Vec<u16>>();

    U16String::from_vec(units).to_string_lossy()
}

/// Syntactic sugar for producing various hashes of data. Typically applied to ```[u8]``` slices.
///
/// ```rust
/// use peview::buffer::HashData;
///
/// let digest = b"abc".md5();
///
/// assert_eq!(hex::encode(digest), "900150983cd24fb0d6963f7d28e17f72");
/// ```
pub trait HashData {
    /// Produce an MD5 hash.
    fn md5(&self) -> Vec<u8>;
    /// Produce a SHA1 hash.
    fn sha1(&self) -> Vec<u8>;
    /// Produce a SHA256 hash.
    fn sha256(&self) -> Vec<u8>;
}
impl HashData for [u8] {
    fn md5(&self) -> Vec<u8> {
        let mut hash = Md5::new();
        hash.update(self);
        hash.finalize().to_vec()
    }
    fn sha1(&self) -> Vec<u8> {
        let mut hash = Sha1::new();
        hash.update(self);
        hash.finalize().to_vec()
    }
    fn sha256(&self) -> Vec<u8> {
        let mut hash = Sha256::new();
        hash.update(self);
        hash.finalize().to_vec()
    }
}

/// Syntactic sugar to calculate entropy on a given object.
pub trait Entropy {
    /// Calculates the entropy of a given object. Returns a value between 0.0 (low entropy) and 8.0 (high entropy).
    fn entropy(&self) -> f64;
}
impl Entropy for [u8] {
    // Shannon entropy over byte frequencies, as pefile computes it
    fn entropy(&self) -> f64 {
        if self.is_empty() { return 0.0_f64; }

        let mut occurences = [0usize; 256];
        for &c in self { occurences[c as usize] += 1; }

        let mut entropy = 0.0_f64;

        for weight in occurences.iter().filter(|&&w| w != 0) {
            let p_x = (*weight as f64) / (self.len() as f64);
            entropy -= p_x * p_x.log2();
        }

        entropy.abs()
    }
}
