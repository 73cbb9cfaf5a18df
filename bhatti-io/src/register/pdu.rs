//! Modbus PDU and framing helpers for the in-crate ASCII and UDP links
//!
//! PDU layout (all multi-byte fields big-endian):
//!
//! ```text
//! read request   [FC] [START:2] [COUNT:2]
//! read response  [FC] [BYTES:1] [REG:2] * COUNT
//! write request  [0x06] [ADDR:2] [VALUE:2]     (echoed back on success)
//! exception      [FC | 0x80] [CODE:1]
//! ```
//!
//! ASCII frame: `:` + hex(unit, PDU, LRC) + CR LF, LRC = two's complement of
//! the byte sum. UDP datagram: MBAP header (transaction, protocol 0, length,
//! unit) followed by the PDU.

use crate::error::{TransportError, TransportResult};

/// Read holding registers
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Read input registers
pub const READ_INPUT_REGISTERS: u8 = 0x04;
/// Write single register
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Largest register count one read may request
pub const MAX_READ_COUNT: u16 = 125;

/// MBAP header length
pub const MBAP_HEADER_LEN: usize = 7;

/// Build a register read request PDU
pub fn read_request(function: u8, start: u16, count: u16) -> TransportResult<Vec<u8>> {
    if count == 0 || count > MAX_READ_COUNT {
        return Err(TransportError::InvalidRequest(format!(
            "register count {} outside 1..={}",
            count, MAX_READ_COUNT
        )));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function);
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    Ok(pdu)
}

/// Build a write-single-register request PDU
pub fn write_single_request(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(WRITE_SINGLE_REGISTER);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Standard exception code names
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

fn check_function(function: u8, pdu: &[u8]) -> TransportResult<()> {
    match pdu.first() {
        None => Err(TransportError::InvalidResponse("empty PDU".to_string())),
        Some(&fc) if fc == function | 0x80 => {
            let code = pdu.get(1).copied().unwrap_or(0);
            Err(TransportError::Exception {
                function,
                code: format!("{:#04x} ({})", code, exception_name(code)),
            })
        }
        Some(&fc) if fc != function => Err(TransportError::InvalidResponse(format!(
            "function {:#04x} in reply to {:#04x}",
            fc, function
        ))),
        Some(_) => Ok(()),
    }
}

/// Decode a register read response PDU
pub fn parse_read_response(function: u8, count: u16, pdu: &[u8]) -> TransportResult<Vec<u16>> {
    check_function(function, pdu)?;

    let expected = count as usize * 2;
    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    if byte_count != expected || pdu.len() < 2 + expected {
        return Err(TransportError::InvalidResponse(format!(
            "expected {} register bytes, got {} (PDU {} bytes)",
            expected,
            byte_count,
            pdu.len()
        )));
    }

    Ok(pdu[2..2 + expected]
        .chunks_exact(2)
        .map(|word| u16::from_be_bytes([word[0], word[1]]))
        .collect())
}

/// Check a write-single-register echo
pub fn parse_write_single_response(address: u16, value: u16, pdu: &[u8]) -> TransportResult<()> {
    check_function(WRITE_SINGLE_REGISTER, pdu)?;
    if pdu != write_single_request(address, value).as_slice() {
        return Err(TransportError::InvalidResponse(
            "write echo does not match request".to_string(),
        ));
    }
    Ok(())
}

/// Longitudinal redundancy check used by Modbus ASCII
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Encode an ASCII frame (including `:` and CR LF)
pub fn encode_ascii(unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(pdu.len() + 2);
    raw.push(unit);
    raw.extend_from_slice(pdu);
    raw.push(lrc(&raw));

    let mut frame = Vec::with_capacity(raw.len() * 2 + 3);
    frame.push(b':');
    frame.extend_from_slice(hex::encode_upper(&raw).as_bytes());
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Decode an ASCII frame line (CR LF already stripped) into unit and PDU
pub fn decode_ascii(line: &str) -> TransportResult<(u8, Vec<u8>)> {
    let body = line
        .trim_end()
        .strip_prefix(':')
        .ok_or_else(|| TransportError::InvalidResponse(format!("missing ':' in {:?}", line)))?;
    let raw = hex::decode(body)
        .map_err(|e| TransportError::InvalidResponse(format!("bad hex in ASCII frame: {}", e)))?;
    if raw.len() < 3 {
        return Err(TransportError::InvalidResponse(format!(
            "ASCII frame too short: {} bytes",
            raw.len()
        )));
    }

    let (data, check) = raw.split_at(raw.len() - 1);
    let expected = lrc(data);
    if check[0] != expected {
        return Err(TransportError::InvalidResponse(format!(
            "LRC mismatch: expected {:#04x}, got {:#04x}",
            expected, check[0]
        )));
    }
    Ok((data[0], data[1..].to_vec()))
}

/// Encode an MBAP-framed request
pub fn encode_mbap(transaction: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(pdu);
    frame
}

/// Decode an MBAP-framed reply into transaction id, unit and PDU
pub fn decode_mbap(frame: &[u8]) -> TransportResult<(u16, u8, Vec<u8>)> {
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return Err(TransportError::InvalidResponse(format!(
            "MBAP frame too short: {} bytes",
            frame.len()
        )));
    }
    let transaction = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol = u16::from_be_bytes([frame[2], frame[3]]);
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if protocol != 0 {
        return Err(TransportError::InvalidResponse(format!(
            "protocol id {} is not Modbus",
            protocol
        )));
    }
    if length < 2 || frame.len() < 6 + length {
        return Err(TransportError::InvalidResponse(format!(
            "MBAP length {} does not fit {} byte frame",
            length,
            frame.len()
        )));
    }
    Ok((transaction, frame[6], frame[7..6 + length].to_vec()))
}
