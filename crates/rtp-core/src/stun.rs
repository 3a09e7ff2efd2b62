//! STUN Binding Indication (RFC 5389) used as a NAT keepalive

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

/// Binding request/indication method with the indication class bits set
pub const BINDING_INDICATION: u16 = 0x0011;

/// Fixed magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of a STUN message header
pub const STUN_HEADER_SIZE: usize = 20;

/// Encode an attribute-less Binding Indication with a random transaction id
pub fn binding_indication() -> Bytes {
    let mut tid = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut tid);
    binding_indication_with_tid(&tid)
}

/// Encode an attribute-less Binding Indication with the given transaction id
pub fn binding_indication_with_tid(tid: &[u8; 12]) -> Bytes {
    let mut buf = BytesMut::with_capacity(STUN_HEADER_SIZE);
    buf.put_u16(BINDING_INDICATION);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(tid);
    buf.freeze()
}

/// True when `data` looks like a STUN message
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE
        && data[0] & 0xc0 == 0
        && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indication_layout() {
        let msg = binding_indication_with_tid(&[7u8; 12]);
        assert_eq!(msg.len(), 20);
        assert_eq!(&msg[0..2], &[0x00, 0x11]);
        assert_eq!(&msg[2..4], &[0, 0]);
        assert_eq!(&msg[4..8], &[0x21, 0x12, 0xa4, 0x42]);
        assert_eq!(&msg[8..], &[7u8; 12]);
        assert!(is_stun(&msg));
    }

    #[test]
    fn test_random_transaction_ids_differ() {
        let a = binding_indication();
        let b = binding_indication();
        assert_ne!(a[8..], b[8..]);
        assert!(!is_stun(&[0x80; 20]));
    }
}
