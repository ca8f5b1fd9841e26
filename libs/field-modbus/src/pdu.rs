//! PDU codec for the two operations this system uses: read-holding-registers
//! requests and their normal or exception responses.

use crate::error::{LinkError, Result};

/// Function codes understood by the acquisition units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            _ => Err(LinkError::Protocol(format!(
                "Unsupported function code: 0x{:02X}",
                value
            ))),
        }
    }
}

/// Modbus exception codes the slave side can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    ServerDeviceBusy = 0x06,
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for ExceptionCode {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ExceptionCode::IllegalFunction),
            0x02 => Ok(ExceptionCode::IllegalDataAddress),
            0x03 => Ok(ExceptionCode::IllegalDataValue),
            0x04 => Ok(ExceptionCode::ServerDeviceFailure),
            0x06 => Ok(ExceptionCode::ServerDeviceBusy),
            _ => Err(LinkError::Protocol(format!(
                "Invalid exception code: 0x{:02X}",
                value
            ))),
        }
    }
}

/// A parsed read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub start_address: u16,
    pub quantity: u16,
}

/// Build a read-holding-registers request PDU.
pub fn build_read_request(start_address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::ReadHoldingRegisters.into());
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Parse a request PDU addressed to a slave. Non-FC3 function codes surface
/// as `IllegalFunction` so the caller can answer on the wire.
pub fn parse_read_request(pdu: &[u8]) -> std::result::Result<ReadRequest, ExceptionCode> {
    if pdu.is_empty() {
        return Err(ExceptionCode::IllegalFunction);
    }
    if pdu[0] != u8::from(FunctionCode::ReadHoldingRegisters) {
        return Err(ExceptionCode::IllegalFunction);
    }
    if pdu.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }

    Ok(ReadRequest {
        start_address: u16::from_be_bytes([pdu[1], pdu[2]]),
        quantity: u16::from_be_bytes([pdu[3], pdu[4]]),
    })
}

/// Build a read response PDU from raw register bytes (already big-endian).
pub fn build_read_response(register_bytes: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + register_bytes.len());
    pdu.push(FunctionCode::ReadHoldingRegisters.into());
    pdu.push(register_bytes.len() as u8);
    pdu.extend_from_slice(register_bytes);
    pdu
}

/// Serialize registers to the big-endian byte layout of a read response.
pub fn registers_to_bytes(values: &[u16]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * 2);
    for &value in values {
        data.extend_from_slice(&value.to_be_bytes());
    }
    data
}

/// Build an exception response for the given raw function code.
pub fn build_exception(function_code: u8, exception: ExceptionCode) -> Vec<u8> {
    vec![function_code | 0x80, exception.into()]
}

/// Parse a response PDU into raw register bytes, surfacing exceptions.
pub fn parse_read_response(pdu: &[u8]) -> Result<Vec<u8>> {
    if pdu.is_empty() {
        return Err(LinkError::Protocol("Empty response PDU".to_string()));
    }

    if pdu[0] & 0x80 != 0 {
        if pdu.len() < 2 {
            return Err(LinkError::Protocol(
                "Truncated exception response".to_string(),
            ));
        }
        return Err(LinkError::Exception(ExceptionCode::try_from(pdu[1])?));
    }

    FunctionCode::try_from(pdu[0])?;

    if pdu.len() < 2 {
        return Err(LinkError::Protocol("Truncated read response".to_string()));
    }
    let byte_count = pdu[1] as usize;
    if pdu.len() < 2 + byte_count {
        return Err(LinkError::Protocol(format!(
            "Response data shorter than byte count: {} < {}",
            pdu.len() - 2,
            byte_count
        )));
    }

    Ok(pdu[2..2 + byte_count].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_round_trip() {
        let pdu = build_read_request(10, 18);
        assert_eq!(pdu, vec![0x03, 0x00, 0x0A, 0x00, 0x12]);

        let req = parse_read_request(&pdu).unwrap();
        assert_eq!(req.start_address, 10);
        assert_eq!(req.quantity, 18);
    }

    #[test]
    fn non_fc3_request_is_illegal_function() {
        let pdu = [0x06, 0x00, 0x01, 0x00, 0xFF];
        assert_eq!(
            parse_read_request(&pdu),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn read_response_round_trip() {
        let bytes = registers_to_bytes(&[0x1234, 0x5678]);
        let pdu = build_read_response(&bytes);
        assert_eq!(pdu, vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);

        let parsed = parse_read_response(&pdu).unwrap();
        assert_eq!(parsed, bytes);
    }

    #[test]
    fn exception_response_surfaces_code() {
        let pdu = build_exception(0x03, ExceptionCode::ServerDeviceBusy);
        assert_eq!(pdu, vec![0x83, 0x06]);

        match parse_read_response(&pdu) {
            Err(LinkError::Exception(ExceptionCode::ServerDeviceBusy)) => {}
            other => panic!("expected busy exception, got {:?}", other),
        }
    }

    #[test]
    fn illegal_address_exception() {
        let pdu = build_exception(0x03, ExceptionCode::IllegalDataAddress);
        match parse_read_response(&pdu) {
            Err(LinkError::Exception(ExceptionCode::IllegalDataAddress)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
