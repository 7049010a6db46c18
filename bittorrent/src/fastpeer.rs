//! BEP 6 "Allowed Fast" set computation. Pure function of the peer's
//! address, our info-hash and the torrent's piece count, so any peer can
//! recompute the same set we offer it without us tracking per-peer state
//! beyond what's already in `SessionState`.

use std::net::IpAddr;

use sha1::Digest;

use crate::ID;

/// Number of pieces offered in a peer's allowed-fast set, per BEP 6.
const ALLOWED_FAST_SET_SIZE: usize = 10;

/// Computes the allowed-fast piece indices for `peer_ip` against
/// `info_hash`, following the reference algorithm: repeatedly hash the
/// peer's /24 (v4) or /64 (v6) network prefix together with the info-hash
/// and the previous digest, folding each 4-byte group of the digest down
/// into a candidate piece index modulo `num_pieces`, skipping duplicates,
/// until `ALLOWED_FAST_SET_SIZE` distinct pieces are collected or every
/// piece has been offered.
pub fn allowed_fast(peer_ip: IpAddr, info_hash: &ID, num_pieces: u32) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }

    let masked = mask_address(peer_ip);
    let mut seed = Vec::with_capacity(masked.len() + 20);
    seed.extend_from_slice(&masked);
    seed.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(ALLOWED_FAST_SET_SIZE.min(num_pieces as usize));
    let mut digest = sha1::Sha1::digest(&seed).to_vec();

    while set.len() < ALLOWED_FAST_SET_SIZE.min(num_pieces as usize) {
        for chunk in digest.clone().chunks_exact(4) {
            if set.len() >= ALLOWED_FAST_SET_SIZE.min(num_pieces as usize) {
                break;
            }
            let x = u32::from_be_bytes(chunk.try_into().unwrap());
            let index = x % num_pieces;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        digest = sha1::Sha1::digest(&digest).to_vec();
    }

    set
}

fn mask_address(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            octets[3] = 0;
            octets.to_vec()
        }
        IpAddr::V6(v6) => {
            let mut segments = v6.octets();
            for b in segments.iter_mut().skip(8) {
                *b = 0;
            }
            segments.to_vec()
        }
    }
}
