//! Write side of the container format.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::crypto::CryptoBinding;
use crate::frame::FileHeader;

/// Serialize the file header. With crypto the trailing MAC is keyed by
/// the binding's header key; otherwise a CRC-32 closes the header.
pub fn write_file_header<W: Write>(
    w: &mut W,
    hdr: &FileHeader,
    crypto: Option<&CryptoBinding>,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&hdr.algo.tag());
    buf.write_u16::<BigEndian>(hdr.version)?;
    buf.write_u16::<BigEndian>(hdr.flags())?;
    buf.write_u64::<BigEndian>(hdr.chunksize)?;
    buf.write_i32::<BigEndian>(hdr.level)?;

    if let Some(binding) = crypto {
        buf.write_u32::<BigEndian>(binding.salt().len() as u32)?;
        buf.extend_from_slice(binding.salt());
        buf.extend_from_slice(binding.nonce());
        if hdr.version >= 7 {
            buf.write_u32::<BigEndian>(binding.keylen() as u32)?;
        }
        let mac = hdr.cksum.mac(&*binding.header_mac_key(), &[&buf]);
        buf.extend_from_slice(&mac);
    } else if hdr.version >= 5 {
        let crc = crc32fast::hash(&buf);
        buf.write_u32::<BigEndian>(crc)?;
    }

    w.write_all(&buf)
}

/// The stream trailer: a zero `cmp_len`.
pub fn write_trailer<W: Write>(w: &mut W) -> std::io::Result<()> {
    w.write_all(&[0u8; 8])
}
