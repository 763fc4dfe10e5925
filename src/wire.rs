//! Byte-buffer encode/decode for the request interface and event stream.
//!
//! The original driver packs these with `#[repr(C)]` structs transmuted
//! directly over an IOCTL buffer. This crate instead encodes explicitly to
//! little-endian bytes: the core has no real IOCTL channel to match layout
//! with, and an explicit codec keeps the wire format independent of struct
//! layout / alignment, at the cost of a few more lines per message (see
//! DESIGN.md).

use crate::address::AddressSet;
use crate::eventing::{EventRecord, SplittingReason};
use crate::error::{Error, Result};
use crate::image_set::ImageName;
use crate::process::Pid;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Tag identifying an event record's shape on the wire. Values chosen to
/// match the original driver's `EventId` enumerators so capture tooling
/// written against that format still recognises this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventId {
    StartSplittingProcess = 0,
    StopSplittingProcess = 1,
    StartSplittingError = 2,
    StopSplittingError = 3,
    ErrorMessage = 4,
}

impl EventId {
    fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => EventId::StartSplittingProcess,
            1 => EventId::StopSplittingProcess,
            2 => EventId::StartSplittingError,
            3 => EventId::StopSplittingError,
            4 => EventId::ErrorMessage,
            _ => return Err(Error::InvalidBuffer("unrecognised event id")),
        })
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_string(buf: &[u8], offset: &mut usize) -> Result<String> {
    let len = read_u32(buf, offset)? as usize;
    let end = offset.checked_add(len).ok_or(Error::InvalidBuffer("string length overflow"))?;
    let slice = buf.get(*offset..end).ok_or(Error::InvalidBuffer("string extends past buffer"))?;
    let s = String::from_utf8(slice.to_vec()).map_err(|_| Error::InvalidBuffer("string is not valid utf-8"))?;
    *offset = end;
    Ok(s)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    let end = *offset + 4;
    let slice = buf.get(*offset..end).ok_or(Error::InvalidBuffer("buffer too short for u32"))?;
    *offset = end;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

/// Encodes `record` as `{eventId, eventSize}` followed by its payload.
pub fn encode_event(record: &EventRecord) -> Vec<u8> {
    let mut payload = Vec::new();
    let id = match record {
        EventRecord::StartSplitting { pid, reason, image } => {
            payload.extend_from_slice(&pid.to_le_bytes());
            payload.extend_from_slice(&reason.bits().to_le_bytes());
            write_string(&mut payload, image.as_str());
            EventId::StartSplittingProcess
        }
        EventRecord::StopSplitting { pid, reason, image } => {
            payload.extend_from_slice(&pid.to_le_bytes());
            payload.extend_from_slice(&reason.bits().to_le_bytes());
            write_string(&mut payload, image.as_str());
            EventId::StopSplittingProcess
        }
        EventRecord::StartSplittingError { pid, image } => {
            payload.extend_from_slice(&pid.to_le_bytes());
            write_string(&mut payload, image.as_str());
            EventId::StartSplittingError
        }
        EventRecord::StopSplittingError { pid, image } => {
            payload.extend_from_slice(&pid.to_le_bytes());
            write_string(&mut payload, image.as_str());
            EventId::StopSplittingError
        }
        EventRecord::ErrorMessage { status, message } => {
            payload.extend_from_slice(&status.to_le_bytes());
            write_string(&mut payload, message);
            EventId::ErrorMessage
        }
    };

    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&(id as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Returns the encoded size of `record` without allocating the full buffer,
/// for the "does it fit the caller's output buffer" check.
pub fn encoded_event_size(record: &EventRecord) -> usize {
    encode_event(record).len()
}

pub fn decode_event(buf: &[u8]) -> Result<EventRecord> {
    let mut offset = 0;
    let id = EventId::from_u32(read_u32(buf, &mut offset)?)?;
    let size = read_u32(buf, &mut offset)? as usize;
    let end = offset.checked_add(size).ok_or(Error::InvalidBuffer("event size overflow"))?;
    if end != buf.len() {
        return Err(Error::InvalidBuffer("event buffer length mismatch"));
    }

    Ok(match id {
        EventId::StartSplittingProcess | EventId::StopSplittingProcess => {
            let pid: Pid = read_u32(buf, &mut offset)?;
            let reason = SplittingReason::from_bits_truncate(read_u32(buf, &mut offset)?);
            let image = ImageName::from_normalized(read_string(buf, &mut offset)?);
            if id == EventId::StartSplittingProcess {
                EventRecord::StartSplitting { pid, reason, image }
            } else {
                EventRecord::StopSplitting { pid, reason, image }
            }
        }
        EventId::StartSplittingError | EventId::StopSplittingError => {
            let pid: Pid = read_u32(buf, &mut offset)?;
            let image = ImageName::from_normalized(read_string(buf, &mut offset)?);
            if id == EventId::StartSplittingError {
                EventRecord::StartSplittingError { pid, image }
            } else {
                EventRecord::StopSplittingError { pid, image }
            }
        }
        EventId::ErrorMessage => {
            let status = read_u32(buf, &mut offset)?;
            let message = read_string(buf, &mut offset)?;
            EventRecord::ErrorMessage { status, message }
        }
    })
}

/// Encodes a SET-CONFIGURATION payload: `{numEntries, totalLength}` followed
/// by N `{offset, length}` entries and a trailing string region.
pub fn encode_configuration(images: &[ImageName]) -> Vec<u8> {
    let mut region = Vec::new();
    let mut entries = Vec::new();
    for image in images {
        let bytes = image.as_str().as_bytes();
        entries.push((region.len() as u32, bytes.len() as u32));
        region.extend_from_slice(bytes);
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&(images.len() as u32).to_le_bytes());
    let total_len_offset = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    for (offset, length) in &entries {
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
    }
    buf.extend_from_slice(&region);

    let total_len = buf.len() as u32;
    buf[total_len_offset..total_len_offset + 4].copy_from_slice(&total_len.to_le_bytes());
    buf
}

pub fn decode_configuration(buf: &[u8]) -> Result<Vec<ImageName>> {
    let mut offset = 0;
    let num_entries = read_u32(buf, &mut offset)? as usize;
    let total_length = read_u32(buf, &mut offset)? as usize;
    if total_length != buf.len() {
        return Err(Error::InvalidBuffer("declared total length does not match buffer"));
    }

    let mut entries = Vec::with_capacity(num_entries);
    for _ in 0..num_entries {
        let rel_offset = read_u32(buf, &mut offset)? as usize;
        let length = read_u32(buf, &mut offset)? as usize;
        entries.push((rel_offset, length));
    }

    let region_start = offset;
    let mut images = Vec::with_capacity(num_entries);
    for (rel_offset, length) in entries {
        let start = region_start.checked_add(rel_offset).ok_or(Error::InvalidBuffer("offset overflow"))?;
        let end = start.checked_add(length).ok_or(Error::InvalidBuffer("slice length overflow"))?;
        let slice = buf.get(start..end).ok_or(Error::InvalidBuffer("slice extends past buffer"))?;
        let name = std::str::from_utf8(slice).map_err(|_| Error::InvalidBuffer("image name is not valid utf-8"))?;
        images.push(ImageName::from_normalized(name.to_string()));
    }
    Ok(images)
}

/// Encodes REGISTER-IP-ADDRESSES / GET-IP-ADDRESSES payloads: four fixed
/// 16-byte slots (v4 addresses zero-padded into the same width as v6 so the
/// layout never depends on which families are present).
pub fn encode_addresses(addresses: &AddressSet) -> [u8; 64] {
    let mut buf = [0u8; 64];
    write_v4_slot(&mut buf[0..16], addresses.tunnel_ipv4);
    write_v4_slot(&mut buf[16..32], addresses.internet_ipv4);
    write_v6_slot(&mut buf[32..48], addresses.tunnel_ipv6);
    write_v6_slot(&mut buf[48..64], addresses.internet_ipv6);
    buf
}

pub fn decode_addresses(buf: &[u8; 64]) -> AddressSet {
    AddressSet {
        tunnel_ipv4: read_v4_slot(&buf[0..16]),
        internet_ipv4: read_v4_slot(&buf[16..32]),
        tunnel_ipv6: read_v6_slot(&buf[32..48]),
        internet_ipv6: read_v6_slot(&buf[48..64]),
    }
}

fn write_v4_slot(slot: &mut [u8], addr: Option<Ipv4Addr>) {
    slot[0] = addr.is_some() as u8;
    if let Some(addr) = addr {
        slot[1..5].copy_from_slice(&addr.octets());
    }
}

fn read_v4_slot(slot: &[u8]) -> Option<Ipv4Addr> {
    if slot[0] == 0 {
        return None;
    }
    let octets: [u8; 4] = slot[1..5].try_into().unwrap();
    Some(Ipv4Addr::from(octets))
}

fn write_v6_slot(slot: &mut [u8], addr: Option<Ipv6Addr>) {
    slot[0] = addr.is_some() as u8;
    if let Some(addr) = addr {
        slot[1..15].copy_from_slice(&addr.octets()[..14]);
    }
}

fn read_v6_slot(slot: &[u8]) -> Option<Ipv6Addr> {
    if slot[0] == 0 {
        return None;
    }
    let mut octets = [0u8; 16];
    octets[..14].copy_from_slice(&slot[1..15]);
    Some(Ipv6Addr::from(octets))
}
