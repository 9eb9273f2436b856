//! Buffer builtin methods (handler ids 75-98).

use super::intrinsics::{guard_phase, int_arg, Pressure};
use super::VmError;
use crate::values::{Data, Value};

pub(super) const METHODS: &[(&str, u8)] = &[
    ("len", 75),
    ("length", 76),
    ("capacity", 77),
    ("push", 78),
    ("push_u16", 79),
    ("push_u32", 80),
    ("read_u8", 81),
    ("write_u8", 82),
    ("read_u16", 83),
    ("write_u16", 84),
    ("read_u32", 85),
    ("write_u32", 86),
    ("read_i8", 87),
    ("read_i16", 88),
    ("read_i32", 89),
    ("read_f32", 90),
    ("read_f64", 91),
    ("slice", 92),
    ("clear", 93),
    ("fill", 94),
    ("resize", 95),
    ("to_string", 96),
    ("to_array", 97),
    ("to_hex", 98),
];

fn read<const N: usize>(bytes: &[u8], args: &[Value], method: &str) -> Result<[u8; N], VmError> {
    let offset = usize::try_from(int_arg(args, 0, method)?).ok();
    offset
        .and_then(|o| bytes.get(o..o.checked_add(N)?))
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(|| VmError::Runtime(format!("{method}(): offset out of bounds")))
}

fn write(bytes: &mut [u8], at: i64, data: &[u8], method: &str) -> Result<(), VmError> {
    let slot = usize::try_from(at)
        .ok()
        .and_then(|o| bytes.get_mut(o..o.checked_add(data.len())?))
        .ok_or_else(|| VmError::Runtime(format!("{method}(): offset out of bounds")))?;
    slot.copy_from_slice(data);
    Ok(())
}

fn byte_arg(args: &[Value], i: usize, method: &str) -> Result<u8, VmError> {
    let v = int_arg(args, i, method)?;
    u8::try_from(v).map_err(|_| VmError::Runtime(format!("{method}(): byte value {v} out of range")))
}

pub(super) fn buffer_method(
    id: u8,
    recv: &mut Value,
    args: &[Value],
    pressure: &Pressure<'_>,
) -> Result<Value, VmError> {
    let phase = recv.phase;
    let Data::Buffer(bytes) = &mut recv.data else {
        return Err(VmError::Type("buffer method on a non-Buffer".into()));
    };
    let unit = Value::unit();
    Ok(match id {
        75 | 76 => Value::int(bytes.len() as i64),
        77 => Value::int(bytes.capacity() as i64),
        78..=80 => {
            guard_phase(phase, true, "push to", "buffer")?;
            pressure.check(true, false, "push to")?;
            match id {
                78 => bytes.push(byte_arg(args, 0, "push")?),
                79 => {
                    let v = int_arg(args, 0, "push_u16")? as u16;
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                _ => {
                    let v = int_arg(args, 0, "push_u32")? as u32;
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
            }
            unit
        }
        81 => Value::int(read::<1>(bytes, args, "read_u8")?[0] as i64),
        83 => Value::int(u16::from_le_bytes(read(bytes, args, "read_u16")?) as i64),
        85 => Value::int(u32::from_le_bytes(read(bytes, args, "read_u32")?) as i64),
        87 => Value::int(read::<1>(bytes, args, "read_i8")?[0] as i8 as i64),
        88 => Value::int(i16::from_le_bytes(read(bytes, args, "read_i16")?) as i64),
        89 => Value::int(i32::from_le_bytes(read(bytes, args, "read_i32")?) as i64),
        90 => Value::float(f32::from_le_bytes(read(bytes, args, "read_f32")?) as f64),
        91 => Value::float(f64::from_le_bytes(read(bytes, args, "read_f64")?)),
        82 | 84 | 86 => {
            guard_phase(phase, false, "write to", "buffer")?;
            let at = int_arg(args, 0, "write")?;
            let v = int_arg(args, 1, "write")?;
            match id {
                82 => write(bytes, at, &[v as u8], "write_u8")?,
                84 => write(bytes, at, &(v as u16).to_le_bytes(), "write_u16")?,
                _ => write(bytes, at, &(v as u32).to_le_bytes(), "write_u32")?,
            }
            unit
        }
        92 => {
            let len = bytes.len() as i64;
            let start = int_arg(args, 0, "slice")?.clamp(0, len) as usize;
            let end = match args.get(1) {
                Some(_) => int_arg(args, 1, "slice")?.clamp(start as i64, len) as usize,
                None => len as usize,
            };
            Value::buffer(bytes[start..end].to_vec())
        }
        93 => {
            guard_phase(phase, true, "clear", "buffer")?;
            pressure.check(false, true, "clear")?;
            bytes.clear();
            unit
        }
        94 => {
            guard_phase(phase, false, "fill", "buffer")?;
            let b = byte_arg(args, 0, "fill")?;
            bytes.fill(b);
            unit
        }
        95 => {
            let n = usize::try_from(int_arg(args, 0, "resize")?)
                .map_err(|_| VmError::Runtime("resize(): size must be >= 0".into()))?;
            guard_phase(phase, true, "resize", "buffer")?;
            pressure.check(n > bytes.len(), n < bytes.len(), "resize")?;
            bytes.resize(n, 0);
            unit
        }
        96 => Value::string(String::from_utf8_lossy(bytes).into_owned()),
        97 => Value::array(bytes.iter().map(|b| Value::int(*b as i64)).collect()),
        98 => Value::string(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()),
        _ => return Err(VmError::Runtime(format!("unknown buffer builtin {id}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PressureMode;
    use crate::values::Phase;

    const FREE: Pressure<'static> = Pressure { var: None, mode: None };

    #[test]
    fn little_endian_reads_and_writes() {
        let mut buf = Value::buffer(vec![0; 4]);
        buffer_method(86, &mut buf, &[Value::int(0), Value::int(0x0102_0304)], &FREE).unwrap();
        assert_eq!(buffer_method(81, &mut buf, &[Value::int(0)], &FREE).unwrap(), Value::int(4));
        assert_eq!(
            buffer_method(85, &mut buf, &[Value::int(0)], &FREE).unwrap(),
            Value::int(0x0102_0304)
        );
        assert!(buffer_method(83, &mut buf, &[Value::int(3)], &FREE).is_err());
        assert_eq!(buffer_method(98, &mut buf, &[], &FREE).unwrap(), Value::string("04030201"));
    }

    #[test]
    fn sublimated_buffer_allows_writes_but_not_growth() {
        let mut buf = Value::buffer(vec![1, 2]).with_phase(Phase::Sublimated);
        buffer_method(94, &mut buf, &[Value::int(9)], &FREE).unwrap();
        assert!(buffer_method(78, &mut buf, &[Value::int(1)], &FREE).is_err());
        assert_eq!(buffer_method(75, &mut buf, &[], &FREE).unwrap(), Value::int(2));
    }

    #[test]
    fn pressure_blocks_shrinking_resize() {
        let mut buf = Value::buffer(vec![0; 8]);
        let p = Pressure {
            var: Some("buf"),
            mode: Some(PressureMode::NoShrink),
        };
        let err = buffer_method(95, &mut buf, &[Value::int(2)], &p).unwrap_err();
        assert_eq!(err.to_string(), "pressurized (no_shrink): cannot resize 'buf'");
        buffer_method(95, &mut buf, &[Value::int(16)], &p).unwrap();
        assert_eq!(buffer_method(75, &mut buf, &[], &p).unwrap(), Value::int(16));
    }
}
