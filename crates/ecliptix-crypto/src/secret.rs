//! Locked, wipe-on-drop secret storage.
//!
//! `SecretBuffer` is the ONLY owner of secret bytes in this codebase. The
//! region is locked into resident memory where the platform allows it
//! (`mlock` on unix), and is zeroized before release on every path,
//! including panics during unwinding. Reads hand out a borrow whose
//! lifetime cannot outlive the buffer; comparison is constant-time.

use std::fmt;

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::ProtocolError;

/// An owned, fixed-length region of locked memory, wiped on drop.
pub struct SecretBuffer {
    buf: Box<[u8]>,
    locked: bool,
}

impl SecretBuffer {
    /// Allocate a zero-filled secret region of `len` bytes.
    pub fn zeroed(len: usize) -> Result<Self, ProtocolError> {
        if len == 0 {
            return Err(ProtocolError::InvalidInput(
                "secret buffer length must be non-zero".into(),
            ));
        }
        let buf = vec![0u8; len].into_boxed_slice();
        let locked = lock_region(&buf);
        Ok(Self { buf, locked })
    }

    /// Allocate a secret region holding a copy of `bytes`.
    ///
    /// The caller remains responsible for wiping its own copy.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut out = Self::zeroed(bytes.len())?;
        out.buf.copy_from_slice(bytes);
        Ok(out)
    }

    /// Allocate a secret region filled from the CSRNG.
    pub fn random(len: usize) -> Result<Self, ProtocolError> {
        use rand::RngCore;
        let mut out = Self::zeroed(len)?;
        rand::rngs::OsRng.fill_bytes(&mut out.buf);
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the contents read-only. The view cannot outlive the buffer.
    pub fn read(&self) -> &[u8] {
        &self.buf
    }

    /// Borrow the contents mutably, e.g. to receive derived key material.
    pub fn write(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Borrow as a fixed 32-byte key. Fails when the buffer is another size.
    pub fn as_key32(&self) -> Result<&[u8; 32], ProtocolError> {
        self.buf
            .as_ref()
            .try_into()
            .map_err(|_| ProtocolError::InvalidInput(format!(
                "expected a 32-byte secret, got {} bytes",
                self.buf.len()
            )))
    }

    /// Constant-time equality against `other`.
    ///
    /// Length mismatch returns false without touching the contents; equal
    /// lengths compare in time independent of the first differing position.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        if self.buf.len() != other.len() {
            return false;
        }
        self.buf.ct_eq(other).into()
    }

    /// Copy into a fresh locked region.
    pub fn try_clone(&self) -> Result<Self, ProtocolError> {
        Self::from_slice(&self.buf)
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.buf.zeroize();
        if self.locked {
            unlock_region(&self.buf);
        }
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer({} bytes, redacted)", self.buf.len())
    }
}

/// Constant-time equality over two public-ish byte slices.
///
/// Used wherever a comparison involves key material that must not leak its
/// first differing position (stored peer DH publics, logout tags).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(unix)]
fn lock_region(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    // Best effort: RLIMIT_MEMLOCK may deny us; the buffer still zeroizes.
    let rc = unsafe { libc::mlock(buf.as_ptr() as *const libc::c_void, buf.len()) };
    rc == 0
}

#[cfg(unix)]
fn unlock_region(buf: &[u8]) {
    unsafe {
        libc::munlock(buf.as_ptr() as *const libc::c_void, buf.len());
    }
}

#[cfg(not(unix))]
fn lock_region(_buf: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_region(_buf: &[u8]) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_length() {
        assert!(SecretBuffer::zeroed(0).is_err());
    }

    #[test]
    fn read_returns_stored_bytes() {
        let sb = SecretBuffer::from_slice(&[7u8; 32]).unwrap();
        assert_eq!(sb.read(), &[7u8; 32]);
        assert_eq!(sb.len(), 32);
    }

    #[test]
    fn ct_eq_agrees_with_contents() {
        let sb = SecretBuffer::from_slice(b"0123456789abcdef").unwrap();
        assert!(sb.ct_eq(b"0123456789abcdef"));
        assert!(!sb.ct_eq(b"0123456789abcdeF"));
        assert!(!sb.ct_eq(b"0123"));
    }

    #[test]
    fn clone_is_independent() {
        let a = SecretBuffer::from_slice(&[1u8; 32]).unwrap();
        let mut b = a.try_clone().unwrap();
        b.write()[0] = 9;
        assert_eq!(a.read()[0], 1);
        assert_eq!(b.read()[0], 9);
    }

    #[test]
    fn as_key32_checks_length() {
        let a = SecretBuffer::from_slice(&[1u8; 32]).unwrap();
        assert!(a.as_key32().is_ok());
        let b = SecretBuffer::from_slice(&[1u8; 16]).unwrap();
        assert!(b.as_key32().is_err());
    }
}
