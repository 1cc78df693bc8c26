use super::varint::{PackError, Packer, Unpacker};

pub const MSG_INFO: i32 = 1;
pub const MSG_CON_READY: i32 = 2;
pub const MSG_SNAP: i32 = 3;
pub const MSG_SNAP_EMPTY: i32 = 4;
pub const MSG_SNAP_SINGLE: i32 = 5;
pub const MSG_INPUT_TIMING: i32 = 6;
pub const MSG_ENTER_GAME: i32 = 7;
pub const MSG_INPUT: i32 = 8;

/// Input payloads are capped so a hostile client cannot make the server
/// buffer arbitrary state.
pub const MAX_INPUT_WORDS: usize = 128;

/// The low bit of the leading varint selects the system namespace; game
/// messages travel with the bit clear and are opaque to the engine.
pub fn pack_msg_id(msg: i32, system: bool) -> i32 {
    (msg << 1) | system as i32
}

pub fn unpack_msg_id(value: i32) -> (i32, bool) {
    (value >> 1, value & 1 != 0)
}

/// Engine-level messages exchanged over vital (and, for snapshots,
/// non-vital) chunks once a connection is online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMsg {
    Info {
        version: String,
        name: String,
        password: String,
    },
    ConReady,
    Snap {
        tick: i32,
        delta_tick: i32,
        num_parts: i32,
        part: i32,
        crc: i32,
        data: Vec<u8>,
    },
    SnapEmpty {
        tick: i32,
        delta_tick: i32,
    },
    SnapSingle {
        tick: i32,
        delta_tick: i32,
        crc: i32,
        data: Vec<u8>,
    },
    InputTiming {
        intended_tick: i32,
        time_left: i32,
    },
    EnterGame,
    Input {
        acked_tick: i32,
        intended_tick: i32,
        data: Vec<i32>,
    },
}

impl SystemMsg {
    pub fn msg_id(&self) -> i32 {
        match self {
            SystemMsg::Info { .. } => MSG_INFO,
            SystemMsg::ConReady => MSG_CON_READY,
            SystemMsg::Snap { .. } => MSG_SNAP,
            SystemMsg::SnapEmpty { .. } => MSG_SNAP_EMPTY,
            SystemMsg::SnapSingle { .. } => MSG_SNAP_SINGLE,
            SystemMsg::InputTiming { .. } => MSG_INPUT_TIMING,
            SystemMsg::EnterGame => MSG_ENTER_GAME,
            SystemMsg::Input { .. } => MSG_INPUT,
        }
    }

    pub fn pack(&self, packer: &mut Packer) -> Result<(), PackError> {
        packer.add_int(pack_msg_id(self.msg_id(), true))?;
        match self {
            SystemMsg::Info {
                version,
                name,
                password,
            } => {
                packer.add_string(version)?;
                packer.add_string(name)?;
                packer.add_string(password)?;
            }
            SystemMsg::ConReady | SystemMsg::EnterGame => {}
            SystemMsg::Snap {
                tick,
                delta_tick,
                num_parts,
                part,
                crc,
                data,
            } => {
                packer.add_int(*tick)?;
                packer.add_int(*delta_tick)?;
                packer.add_int(*num_parts)?;
                packer.add_int(*part)?;
                packer.add_int(*crc)?;
                packer.add_int(data.len() as i32)?;
                packer.add_raw(data)?;
            }
            SystemMsg::SnapEmpty { tick, delta_tick } => {
                packer.add_int(*tick)?;
                packer.add_int(*delta_tick)?;
            }
            SystemMsg::SnapSingle {
                tick,
                delta_tick,
                crc,
                data,
            } => {
                packer.add_int(*tick)?;
                packer.add_int(*delta_tick)?;
                packer.add_int(*crc)?;
                packer.add_int(data.len() as i32)?;
                packer.add_raw(data)?;
            }
            SystemMsg::InputTiming {
                intended_tick,
                time_left,
            } => {
                packer.add_int(*intended_tick)?;
                packer.add_int(*time_left)?;
            }
            SystemMsg::Input {
                acked_tick,
                intended_tick,
                data,
            } => {
                packer.add_int(*acked_tick)?;
                packer.add_int(*intended_tick)?;
                packer.add_int((data.len() * 4) as i32)?;
                for &word in data {
                    packer.add_int(word)?;
                }
            }
        }
        Ok(())
    }

    /// Decodes the body of a system message whose id was already read.
    pub fn unpack(msg_id: i32, unpacker: &mut Unpacker<'_>) -> Result<SystemMsg, PackError> {
        match msg_id {
            MSG_INFO => Ok(SystemMsg::Info {
                version: unpacker.get_string()?.to_string(),
                name: unpacker.get_string()?.to_string(),
                password: unpacker.get_string()?.to_string(),
            }),
            MSG_CON_READY => Ok(SystemMsg::ConReady),
            MSG_SNAP => {
                let tick = unpacker.get_int()?;
                let delta_tick = unpacker.get_int()?;
                let num_parts = unpacker.get_int()?;
                let part = unpacker.get_int()?;
                let crc = unpacker.get_int()?;
                let size = unpacker.get_int()?;
                if size < 0 {
                    return Err(PackError::Truncated);
                }
                let data = unpacker.get_raw(size as usize)?.to_vec();
                Ok(SystemMsg::Snap {
                    tick,
                    delta_tick,
                    num_parts,
                    part,
                    crc,
                    data,
                })
            }
            MSG_SNAP_EMPTY => Ok(SystemMsg::SnapEmpty {
                tick: unpacker.get_int()?,
                delta_tick: unpacker.get_int()?,
            }),
            MSG_SNAP_SINGLE => {
                let tick = unpacker.get_int()?;
                let delta_tick = unpacker.get_int()?;
                let crc = unpacker.get_int()?;
                let size = unpacker.get_int()?;
                if size < 0 {
                    return Err(PackError::Truncated);
                }
                let data = unpacker.get_raw(size as usize)?.to_vec();
                Ok(SystemMsg::SnapSingle {
                    tick,
                    delta_tick,
                    crc,
                    data,
                })
            }
            MSG_INPUT_TIMING => Ok(SystemMsg::InputTiming {
                intended_tick: unpacker.get_int()?,
                time_left: unpacker.get_int()?,
            }),
            MSG_ENTER_GAME => Ok(SystemMsg::EnterGame),
            MSG_INPUT => {
                let acked_tick = unpacker.get_int()?;
                let intended_tick = unpacker.get_int()?;
                let size = unpacker.get_int()?;
                if size < 0 || size as usize > MAX_INPUT_WORDS * 4 {
                    return Err(PackError::Truncated);
                }
                let mut data = Vec::with_capacity(size as usize / 4);
                for _ in 0..size / 4 {
                    data.push(unpacker.get_int()?);
                }
                Ok(SystemMsg::Input {
                    acked_tick,
                    intended_tick,
                    data,
                })
            }
            _ => Err(PackError::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: SystemMsg) -> SystemMsg {
        let mut packer = Packer::new(2048);
        msg.pack(&mut packer).unwrap();
        let mut unpacker = Unpacker::new(packer.data());
        let (msg_id, system) = unpack_msg_id(unpacker.get_int().unwrap());
        assert!(system);
        SystemMsg::unpack(msg_id, &mut unpacker).unwrap()
    }

    #[test]
    fn test_msg_id_namespace() {
        assert_eq!(unpack_msg_id(pack_msg_id(MSG_INPUT, true)), (MSG_INPUT, true));
        assert_eq!(unpack_msg_id(pack_msg_id(12, false)), (12, false));
    }

    #[test]
    fn test_info_roundtrip() {
        let msg = SystemMsg::Info {
            version: "0.1".into(),
            name: "grendel".into(),
            password: "".into(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_snap_roundtrip() {
        let msg = SystemMsg::Snap {
            tick: 1200,
            delta_tick: 12,
            num_parts: 3,
            part: 1,
            crc: -559038737,
            data: vec![1, 2, 3, 200, 255],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_input_roundtrip() {
        let msg = SystemMsg::Input {
            acked_tick: 95,
            intended_tick: 101,
            data: vec![1, -1, 0, 77],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_oversized_input_rejected() {
        let mut packer = Packer::new(4096);
        packer.add_int(95).unwrap();
        packer.add_int(101).unwrap();
        packer.add_int((MAX_INPUT_WORDS as i32 + 1) * 4).unwrap();
        let mut unpacker = Unpacker::new(packer.data());
        assert!(SystemMsg::unpack(MSG_INPUT, &mut unpacker).is_err());
    }
}
