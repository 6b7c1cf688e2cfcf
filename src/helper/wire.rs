//! Fixed-size request/response records for the privileged-helper protocol
//! (§4.1, §6 "Privileged-helper wire protocol"). Shared between the client
//! (`sfptpd`) and the server (`sfptpd-helper`) so the two binaries cannot
//! drift apart on layout.

use std::io;

pub const OPEN_DEV_PATH_LEN: usize = 128;
pub const FAILING_STEP_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum RequestTag {
    Sync = 0,
    Close = 1,
    OpenChrony = 2,
    OpenDev = 3,
    ChronyControl = 4,
}

impl RequestTag {
    fn from_u32(v: u32) -> Option<RequestTag> {
        match v {
            0 => Some(RequestTag::Sync),
            1 => Some(RequestTag::Close),
            2 => Some(RequestTag::OpenChrony),
            3 => Some(RequestTag::OpenDev),
            4 => Some(RequestTag::ChronyControl),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(C)]
pub struct OpenDevPayload {
    pub path: [u8; OPEN_DEV_PATH_LEN],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct ChronyControlPayload {
    pub op: u32,
}

/// Wire request. A plain Rust enum rather than the C union the spec
/// describes: the union's only job was giving every variant a fixed,
/// uniform size on the wire, which `encode`/`decode` below do directly.
#[derive(Clone, Debug)]
pub enum Request {
    Sync,
    Close,
    OpenChrony,
    OpenDev { path: String },
    ChronyControl { op: u32 },
}

/// Total encoded size of a request record: tag (4 bytes) + the largest
/// payload (the 128-byte path).
pub const REQUEST_WIRE_SIZE: usize = 4 + OPEN_DEV_PATH_LEN;

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_WIRE_SIZE] {
        let mut buf = [0u8; REQUEST_WIRE_SIZE];
        let (tag, rest) = buf.split_at_mut(4);
        match self {
            Request::Sync => tag.copy_from_slice(&(RequestTag::Sync as u32).to_ne_bytes()),
            Request::Close => tag.copy_from_slice(&(RequestTag::Close as u32).to_ne_bytes()),
            Request::OpenChrony => tag.copy_from_slice(&(RequestTag::OpenChrony as u32).to_ne_bytes()),
            Request::OpenDev { path } => {
                tag.copy_from_slice(&(RequestTag::OpenDev as u32).to_ne_bytes());
                let bytes = path.as_bytes();
                let n = bytes.len().min(OPEN_DEV_PATH_LEN - 1);
                rest[..n].copy_from_slice(&bytes[..n]);
            }
            Request::ChronyControl { op } => {
                tag.copy_from_slice(&(RequestTag::ChronyControl as u32).to_ne_bytes());
                rest[..4].copy_from_slice(&op.to_ne_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Request> {
        if buf.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "helper request too short"));
        }
        let tag = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let rest = &buf[4..];
        match RequestTag::from_u32(tag) {
            Some(RequestTag::Sync) => Ok(Request::Sync),
            Some(RequestTag::Close) => Ok(Request::Close),
            Some(RequestTag::OpenChrony) => Ok(Request::OpenChrony),
            Some(RequestTag::OpenDev) => {
                let n = rest.iter().position(|&b| b == 0).unwrap_or(rest.len().min(OPEN_DEV_PATH_LEN));
                let path = String::from_utf8_lossy(&rest[..n]).into_owned();
                Ok(Request::OpenDev { path })
            }
            Some(RequestTag::ChronyControl) => {
                let op = u32::from_ne_bytes(rest[0..4].try_into().unwrap());
                Ok(Request::ChronyControl { op })
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown helper request tag")),
        }
    }
}

/// Wire response. `OpenChrony`/`OpenDev`/`ChronyControl` all carry an `rc`;
/// `OpenChrony` additionally carries a short human-readable marker of which
/// connect step failed, for logging on the client side.
#[derive(Clone, Debug)]
pub enum Response {
    Ok,
    OpenChrony { rc: i32, failing_step: String },
    OpenDev { rc: i32 },
    ChronyControl { rc: i32 },
}

pub const RESPONSE_WIRE_SIZE: usize = 4 + 4 + FAILING_STEP_LEN;

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_WIRE_SIZE] {
        let mut buf = [0u8; RESPONSE_WIRE_SIZE];
        match self {
            Response::Ok => buf[0..4].copy_from_slice(&0u32.to_ne_bytes()),
            Response::OpenChrony { rc, failing_step } => {
                buf[0..4].copy_from_slice(&1u32.to_ne_bytes());
                buf[4..8].copy_from_slice(&rc.to_ne_bytes());
                let bytes = failing_step.as_bytes();
                let n = bytes.len().min(FAILING_STEP_LEN - 1);
                buf[8..8 + n].copy_from_slice(&bytes[..n]);
            }
            Response::OpenDev { rc } => {
                buf[0..4].copy_from_slice(&2u32.to_ne_bytes());
                buf[4..8].copy_from_slice(&rc.to_ne_bytes());
            }
            Response::ChronyControl { rc } => {
                buf[0..4].copy_from_slice(&3u32.to_ne_bytes());
                buf[4..8].copy_from_slice(&rc.to_ne_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Response> {
        if buf.len() < 8 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "helper response too short"));
        }
        let tag = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let rc = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        match tag {
            0 => Ok(Response::Ok),
            1 => {
                let tail = &buf[8..(8 + FAILING_STEP_LEN).min(buf.len())];
                let n = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                let failing_step = String::from_utf8_lossy(&tail[..n]).into_owned();
                Ok(Response::OpenChrony { rc, failing_step })
            }
            2 => Ok(Response::OpenDev { rc }),
            3 => Ok(Response::ChronyControl { rc }),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown helper response tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_dev_round_trips() {
        let req = Request::OpenDev { path: "/dev/ptp0".to_string() };
        let encoded = req.encode();
        let decoded = Request::decode(&encoded).unwrap();
        match decoded {
            Request::OpenDev { path } => assert_eq!(path, "/dev/ptp0"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn open_chrony_response_round_trips() {
        let resp = Response::OpenChrony { rc: -13, failing_step: "connect".to_string() };
        let decoded = Response::decode(&resp.encode()).unwrap();
        match decoded {
            Response::OpenChrony { rc, failing_step } => {
                assert_eq!(rc, -13);
                assert_eq!(failing_step, "connect");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn sync_and_close_round_trip() {
        assert!(matches!(Request::decode(&Request::Sync.encode()).unwrap(), Request::Sync));
        assert!(matches!(Request::decode(&Request::Close.encode()).unwrap(), Request::Close));
    }
}
