use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize, specs::group::JoinSpec};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const CONTRIBUTION_H: Header = 2;
const REDUCED_H: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A rank's local buffer, sent to the root for reduction.
    Contribution(&'a [f32]),
    /// The reduced (or broadcast) buffer, sent from the root to every rank.
    Reduced(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join(JoinSpec),
    Welcome { world_size: usize },
    Barrier,
    Verify { what: String, values: Vec<u64> },
    Verified,
    Disconnect,
}

/// The application layer message exchanged between ranks of a process group.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name of the message kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Contribution(_)) => "data/contribution",
            Msg::Data(Payload::Reduced(_)) => "data/reduced",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(header: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid message header {header}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (header, nums) = match payload {
                    Payload::Contribution(nums) => (CONTRIBUTION_H, *nums),
                    Payload::Reduced(nums) => (REDUCED_H, *nums),
                };

                buf.extend_from_slice(&header.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (header_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(header_buf);

        match Header::from_be_bytes(header) {
            ERR_H => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            header @ (CONTRIBUTION_H | REDUCED_H) => {
                let nums: &'a [f32] = bytemuck::try_cast_slice_mut(rest).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("float payload is not a whole number of f32s: {e:?}"),
                    )
                })?;

                let payload = if header == CONTRIBUTION_H {
                    Payload::Contribution(nums)
                } else {
                    Payload::Reduced(nums)
                };

                Ok(Self::Data(payload))
            }
            header => Self::invalid_kind_byte(header),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_body(msg: &Msg<'_>) -> Vec<u32> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).unwrap();
        if let Some(tail) = tail {
            buf.extend_from_slice(tail);
        }

        let mut aligned = vec![0u32; buf.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut aligned)[..buf.len()].copy_from_slice(&buf);
        aligned.truncate(buf.len() / 4);
        aligned
    }

    #[test]
    fn control_frames_carry_json_commands() {
        let msg = Msg::Control(Command::Verify {
            what: "batch shape".into(),
            values: vec![2, 1, 8, 8, 8],
        });

        let mut buf = Vec::new();
        assert!(msg.serialize(&mut buf).unwrap().is_none());

        let parsed = Msg::deserialize(&mut buf).unwrap();
        match parsed {
            Msg::Control(Command::Verify { what, values }) => {
                assert_eq!(what, "batch shape");
                assert_eq!(values, [2, 1, 8, 8, 8]);
            }
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn float_payloads_are_viewed_in_place() {
        let nums = [1.5, -2.0, 3.25];
        let mut body = frame_body(&Msg::Data(Payload::Reduced(&nums)));

        match Msg::deserialize(bytemuck::cast_slice_mut(&mut body)).unwrap() {
            Msg::Data(Payload::Reduced(got)) => assert_eq!(got, nums),
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn unknown_headers_are_rejected() {
        let mut buf = 9u32.to_be_bytes().to_vec();
        let err = Msg::deserialize(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn short_frames_are_rejected() {
        let mut buf = vec![0u8; 2];
        assert!(Msg::deserialize(&mut buf).is_err());
    }
}
