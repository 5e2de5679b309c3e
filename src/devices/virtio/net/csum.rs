//! Checksum finalization for TX packets flagged NEEDS_CSUM.
//!
//! A guest that negotiated checksum offload hands us packets whose
//! transport checksum field is a zero placeholder; the device computes the
//! Internet checksum over `[csum_start..]` plus the pseudo-header the
//! ethertype calls for, and stores it at `csum_start + csum_offset`.

use super::super::VirtioError;

const ETHERTYPE_OFFSET: usize = 12;
const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// One's-complement sum of big-endian 16-bit words; a trailing odd byte is
/// padded with zero.
fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Pseudo-header contribution for the packet's ethertype. Unknown
/// ethertypes (or frames too short to parse) contribute nothing and the
/// checksum degenerates to a plain sum over `[csum_start..]`.
fn pseudo_header_sum(packet: &[u8], csum_start: usize) -> u32 {
    let l4_len = (packet.len() - csum_start) as u32;
    if packet.len() < ETH_HEADER_LEN {
        return 0;
    }
    let ethertype = u16::from_be_bytes([packet[ETHERTYPE_OFFSET], packet[ETHERTYPE_OFFSET + 1]]);
    match ethertype {
        ETHERTYPE_IPV4 if packet.len() >= ETH_HEADER_LEN + 20 => {
            let ip = &packet[ETH_HEADER_LEN..];
            let proto = u32::from(ip[9]);
            sum_words(&ip[12..20]) + proto + l4_len
        }
        ETHERTYPE_IPV6 if packet.len() >= ETH_HEADER_LEN + 40 => {
            let ip = &packet[ETH_HEADER_LEN..];
            let next_header = u32::from(ip[6]);
            sum_words(&ip[8..40]) + next_header + l4_len
        }
        _ => 0,
    }
}

/// Compute and store the transport checksum requested by the virtio-net
/// header. The finalized value never reads `0x0000`; RFC 768 reserves that
/// for "no checksum", so a computed zero is sent as `0xFFFF`.
pub(crate) fn finalize_checksum(
    packet: &mut [u8],
    csum_start: u16,
    csum_offset: u16,
) -> Result<(), VirtioError> {
    let start = usize::from(csum_start);
    let field = start + usize::from(csum_offset);
    if start > packet.len() || field + 2 > packet.len() {
        return Err(VirtioError::ChecksumRange {
            start: csum_start,
            offset: csum_offset,
            len: packet.len(),
        });
    }

    // The field is part of the summed range; make the result independent
    // of whatever placeholder the driver left there.
    packet[field] = 0;
    packet[field + 1] = 0;

    let sum = pseudo_header_sum(packet, start) + sum_words(&packet[start..]);
    let mut csum = !fold(sum);
    if csum == 0 {
        csum = 0xffff;
    }
    packet[field..field + 2].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}
