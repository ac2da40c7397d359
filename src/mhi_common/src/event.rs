/*
Copyright 2026  The MHI Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Device-written events.
//!
//! [`Event::decode`] turns a raw [`Tre`] read from an event ring into a typed value.
//! Anything the decoder does not understand becomes an [`EventError`] instead of
//! being dropped, so the dispatcher can log it and move on.

use thiserror::Error;

use crate::state::MhiState;
use crate::tre::{CompletionCode, EventType, Tre};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown element type {0:#x}")]
    UnknownType(u8),
    #[error("unknown device state {0:#x}")]
    UnknownState(u8),
    #[error("unknown completion code {0:#x}")]
    UnknownCode(u8),
}

/// A decoded event ring element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum Event {
    /// The device moved to a new MHI state.
    StateChange(MhiState),
    /// A command finished. `cmd_ptr` is the device address of the command TRE.
    CommandCompletion { cmd_ptr: u64, code: CompletionCode },
    /// The device entered a new execution environment. The value is the raw
    /// device encoding; hosts translate it through their EE table.
    ExecEnvChange(u8),
    /// Transfer completion. `ptr` is the device address of the last TRE covered.
    Transfer {
        chan: u8,
        ptr: u64,
        len: u16,
        code: CompletionCode,
    },
    /// RSC transfer completion identified by the cookie of the serviced TRE.
    RscTransfer {
        chan: u8,
        cookie: u32,
        len: u16,
        code: CompletionCode,
    },
    /// Response to a timesync doorbell.
    TimeSync { sequence: u32, remote_time: u64 },
    /// The device asks for a new link speed/width.
    BandwidthRequest {
        link_speed: u8,
        link_width: u8,
        sequence: u8,
    },
    /// A transfer event invalidated by a channel reset.
    Stale { chan: u8 },
}

impl Event {
    /// Decode a raw element.
    pub fn decode(tre: &Tre) -> Result<Self, EventError> {
        let ty = EventType::try_from(tre.element_type())?;
        let event = match ty {
            EventType::StateChange => Event::StateChange(MhiState::try_from(tre.code())?),
            EventType::CommandCompletion => Event::CommandCompletion {
                cmd_ptr: tre.ptr,
                code: CompletionCode::try_from(tre.code())?,
            },
            EventType::ExecEnv => Event::ExecEnvChange(tre.code()),
            EventType::Transfer => Event::Transfer {
                chan: tre.chan(),
                ptr: tre.ptr,
                len: tre.xfer_len(),
                code: CompletionCode::try_from(tre.code())?,
            },
            EventType::RscTransfer => Event::RscTransfer {
                chan: tre.chan(),
                cookie: tre.ptr as u32,
                len: tre.xfer_len(),
                code: CompletionCode::try_from(tre.code())?,
            },
            EventType::TimeSync => Event::TimeSync {
                sequence: tre.dword[0],
                remote_time: tre.ptr,
            },
            EventType::BandwidthRequest => Event::BandwidthRequest {
                link_speed: ((tre.ptr >> 32) & 0xFF) as u8,
                link_width: (tre.ptr & 0xFF) as u8,
                sequence: ((tre.dword[0] >> 8) & 0xFF) as u8,
            },
            EventType::Stale => Event::Stale { chan: tre.chan() },
        };

        Ok(event)
    }

    /// The element type this event is carried in.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::StateChange(_) => EventType::StateChange,
            Event::CommandCompletion { .. } => EventType::CommandCompletion,
            Event::ExecEnvChange(_) => EventType::ExecEnv,
            Event::Transfer { .. } => EventType::Transfer,
            Event::RscTransfer { .. } => EventType::RscTransfer,
            Event::TimeSync { .. } => EventType::TimeSync,
            Event::BandwidthRequest { .. } => EventType::BandwidthRequest,
            Event::Stale { .. } => EventType::Stale,
        }
    }

    /// Encode into the raw element a device would write.
    pub fn encode(&self) -> Tre {
        let ty = (self.event_type() as u32) << 16;
        match *self {
            Event::StateChange(state) => Tre {
                ptr: 0,
                dword: [(state as u32) << 24, ty],
            },
            Event::CommandCompletion { cmd_ptr, code } => Tre {
                ptr: cmd_ptr,
                dword: [(code as u32) << 24, ty],
            },
            Event::ExecEnvChange(ee) => Tre {
                ptr: 0,
                dword: [(ee as u32) << 24, ty],
            },
            Event::Transfer {
                chan,
                ptr,
                len,
                code,
            } => Tre {
                ptr,
                dword: [((code as u32) << 24) | len as u32, ((chan as u32) << 24) | ty],
            },
            Event::RscTransfer {
                chan,
                cookie,
                len,
                code,
            } => Tre {
                ptr: cookie as u64,
                dword: [((code as u32) << 24) | len as u32, ((chan as u32) << 24) | ty],
            },
            Event::TimeSync {
                sequence,
                remote_time,
            } => Tre {
                ptr: remote_time,
                dword: [sequence, ty],
            },
            Event::BandwidthRequest {
                link_speed,
                link_width,
                sequence,
            } => Tre {
                ptr: ((link_speed as u64) << 32) | link_width as u64,
                dword: [(sequence as u32) << 8, ty],
            },
            Event::Stale { chan } => Tre {
                ptr: 0,
                dword: [0, ((chan as u32) << 24) | ty],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    #[test]
    fn test_decode_transfer_event() {
        let tre = Tre {
            ptr: 0x8000_0040,
            dword: [(0x2 << 24) | 0x200, (3 << 24) | (0x22 << 16)],
        };
        assert_eq!(
            Event::decode(&tre).unwrap(),
            Event::Transfer {
                chan: 3,
                ptr: 0x8000_0040,
                len: 0x200,
                code: CompletionCode::Eot,
            }
        );
    }

    #[test]
    fn test_decode_bandwidth_request() {
        let tre = Tre {
            ptr: (3 << 32) | 2,
            dword: [0x7 << 8, 0x50 << 16],
        };
        assert_eq!(
            Event::decode(&tre).unwrap(),
            Event::BandwidthRequest {
                link_speed: 3,
                link_width: 2,
                sequence: 7,
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown() {
        let tre = Tre {
            ptr: 0,
            dword: [0, 0x33 << 16],
        };
        assert_eq!(Event::decode(&tre), Err(EventError::UnknownType(0x33)));

        let bad_state = Tre {
            ptr: 0,
            dword: [0x42 << 24, 0x20 << 16],
        };
        assert_eq!(
            Event::decode(&bad_state),
            Err(EventError::UnknownState(0x42))
        );

        let bad_code = Tre {
            ptr: 0,
            dword: [0x9 << 24, (1 << 24) | (0x22 << 16)],
        };
        assert_eq!(Event::decode(&bad_code), Err(EventError::UnknownCode(0x9)));
    }

    impl Arbitrary for Event {
        fn arbitrary(g: &mut Gen) -> Self {
            let codes = [
                CompletionCode::Invalid,
                CompletionCode::Success,
                CompletionCode::Eot,
                CompletionCode::Overflow,
                CompletionCode::Eob,
                CompletionCode::Oob,
                CompletionCode::DbMode,
                CompletionCode::UndefinedErr,
                CompletionCode::BadTre,
            ];
            let states = [
                MhiState::Reset,
                MhiState::Ready,
                MhiState::M0,
                MhiState::M1,
                MhiState::M2,
                MhiState::M3,
                MhiState::M3Fast,
                MhiState::Bhi,
                MhiState::SysErr,
            ];
            let code = *g.choose(&codes).unwrap();
            match u8::arbitrary(g) % 8 {
                0 => Event::StateChange(*g.choose(&states).unwrap()),
                1 => Event::CommandCompletion {
                    cmd_ptr: u64::arbitrary(g),
                    code,
                },
                2 => Event::ExecEnvChange(u8::arbitrary(g)),
                3 => Event::Transfer {
                    chan: u8::arbitrary(g),
                    ptr: u64::arbitrary(g),
                    len: u16::arbitrary(g),
                    code,
                },
                4 => Event::RscTransfer {
                    chan: u8::arbitrary(g),
                    cookie: u32::arbitrary(g),
                    len: u16::arbitrary(g),
                    code,
                },
                5 => Event::TimeSync {
                    sequence: u32::arbitrary(g),
                    remote_time: u64::arbitrary(g),
                },
                6 => Event::BandwidthRequest {
                    link_speed: u8::arbitrary(g),
                    link_width: u8::arbitrary(g),
                    sequence: u8::arbitrary(g),
                },
                _ => Event::Stale {
                    chan: u8::arbitrary(g),
                },
            }
        }
    }

    #[test]
    fn prop_decode_inverts_encode() {
        fn check(event: Event) -> bool {
            Event::decode(&event.encode()) == Ok(event)
        }

        #[cfg(miri)]
        let tests = 16;
        #[cfg(not(miri))]
        let tests = 1000;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(check as fn(Event) -> bool);
    }
}
