//! Stack-image marshalling for a single accelerator call.
//!
//! Mirrors the original ABI layout: a fixed `PARAM_AREA_OFFSET`-byte save
//! area, one 8-byte slot per argument (used for the first
//! [`NUM_ARGS_ON_REGISTER`] only when they overflow onto the stack), then
//! the backing bytes for any stack-buffer arguments, the whole thing
//! rounded up to 16 bytes.

use aveo_core::{AveoError, Result};

/// Arguments beyond this index are passed on the stack rather than in a
/// register.
pub const NUM_ARGS_ON_REGISTER: usize = 8;
/// Byte offset of the first argument slot within the call stack image.
pub const PARAM_AREA_OFFSET: u64 = 176;
/// Upper bound on the number of arguments a single call may carry.
pub const MAX_NUM_ARGS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    fn copies_in(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    fn copies_out(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

#[derive(Debug, Clone)]
enum ArgSlot {
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Buffer { data: Vec<u8>, max_len: usize, direction: Direction },
}

impl ArgSlot {
    fn reg_bits(&self, vemva: u64) -> u64 {
        match self {
            // Integers are sign/zero-widened into the low bits of the slot.
            ArgSlot::I64(v) => *v as u64,
            ArgSlot::U64(v) => *v,
            // Doubles occupy the full 8 bytes bit-for-bit.
            ArgSlot::F64(v) => v.to_bits(),
            // Floats are packed into the high 4 bytes of the slot, matching
            // the original union-based packing so a VE single-precision
            // register load picks up the right half.
            ArgSlot::F32(v) => (v.to_bits() as u64) << 32,
            ArgSlot::Buffer { .. } => vemva,
        }
    }
}

/// A call's argument list, built up with `push_*`, then turned into a
/// [`BuiltCallArgs`] via [`CallArgs::build`].
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    args: Vec<ArgSlot>,
}

impl CallArgs {
    pub fn new() -> Self {
        CallArgs { args: Vec::new() }
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn push_i64(&mut self, v: i64) -> Result<usize> {
        self.push(ArgSlot::I64(v))
    }

    pub fn push_u64(&mut self, v: u64) -> Result<usize> {
        self.push(ArgSlot::U64(v))
    }

    /// Width-specific integer pushes: each widens into the same 8-byte
    /// register slot `push_i64`/`push_u64` use, sign-extending for the
    /// signed widths and zero-extending for the unsigned ones.
    pub fn push_int8(&mut self, v: i8) -> Result<usize> {
        self.push(ArgSlot::I64(v as i64))
    }

    pub fn push_int16(&mut self, v: i16) -> Result<usize> {
        self.push(ArgSlot::I64(v as i64))
    }

    pub fn push_int32(&mut self, v: i32) -> Result<usize> {
        self.push(ArgSlot::I64(v as i64))
    }

    pub fn push_int64(&mut self, v: i64) -> Result<usize> {
        self.push(ArgSlot::I64(v))
    }

    pub fn push_uint8(&mut self, v: u8) -> Result<usize> {
        self.push(ArgSlot::U64(v as u64))
    }

    pub fn push_uint16(&mut self, v: u16) -> Result<usize> {
        self.push(ArgSlot::U64(v as u64))
    }

    pub fn push_uint32(&mut self, v: u32) -> Result<usize> {
        self.push(ArgSlot::U64(v as u64))
    }

    pub fn push_uint64(&mut self, v: u64) -> Result<usize> {
        self.push(ArgSlot::U64(v))
    }

    pub fn push_f32(&mut self, v: f32) -> Result<usize> {
        self.push(ArgSlot::F32(v))
    }

    pub fn push_f64(&mut self, v: f64) -> Result<usize> {
        self.push(ArgSlot::F64(v))
    }

    /// Registers a stack-resident buffer argument. `max_len` is the size of
    /// the region reserved on the accelerator-side stack; `data` is copied
    /// in only if `direction` includes `In`.
    pub fn push_stack_buffer(&mut self, data: Vec<u8>, max_len: usize, direction: Direction) -> Result<usize> {
        if data.len() > max_len {
            return Err(AveoError::InvalidArgs("buffer longer than max_len"));
        }
        self.push(ArgSlot::Buffer { data, max_len, direction })
    }

    /// Overwrites the host-side bytes of a previously pushed buffer argument
    /// (e.g. to fill an `Out` buffer's scratch content before the call).
    pub fn set_stack_buffer(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        match self.args.get_mut(index) {
            Some(ArgSlot::Buffer { data: slot, max_len, .. }) => {
                if data.len() > *max_len {
                    return Err(AveoError::InvalidArgs("buffer longer than max_len"));
                }
                *slot = data;
                Ok(())
            }
            Some(_) => Err(AveoError::InvalidArgs("argument is not a stack buffer")),
            None => Err(AveoError::InvalidArgs("argument index out of range")),
        }
    }

    /// Returns the current host-side bytes of a buffer argument (valid after
    /// `BuiltCallArgs::copyout` has run).
    pub fn stack_buffer(&self, index: usize) -> Result<&[u8]> {
        match self.args.get(index) {
            Some(ArgSlot::Buffer { data, .. }) => Ok(data),
            Some(_) => Err(AveoError::InvalidArgs("argument is not a stack buffer")),
            None => Err(AveoError::InvalidArgs("argument index out of range")),
        }
    }

    fn push(&mut self, slot: ArgSlot) -> Result<usize> {
        if self.args.len() >= MAX_NUM_ARGS {
            return Err(AveoError::InvalidArgs("too many call arguments"));
        }
        self.args.push(slot);
        Ok(self.args.len() - 1)
    }

    /// Lays the arguments out against a given accelerator stack pointer.
    pub fn build(&self, sp: u64) -> Result<BuiltCallArgs> {
        let num_args = self.args.len();
        let slot_region = 8u64 * num_args as u64;
        let buf_base = PARAM_AREA_OFFSET + slot_region;

        let mut buf_offset = 0u64;
        let mut vemvas = vec![0u64; num_args];
        for (i, arg) in self.args.iter().enumerate() {
            if let ArgSlot::Buffer { max_len, .. } = arg {
                vemvas[i] = sp + buf_base + buf_offset;
                buf_offset += align8(*max_len as u64);
            }
        }

        let raw_size = buf_base + buf_offset;
        let stack_size = align16(raw_size);
        let mut image = vec![0u8; stack_size as usize];

        let mut reg_values = Vec::with_capacity(num_args.min(NUM_ARGS_ON_REGISTER));
        let mut copyouts = Vec::new();
        let mut copied_in = false;
        let mut copied_out = false;

        for (i, arg) in self.args.iter().enumerate() {
            let bits = arg.reg_bits(vemvas[i]);
            if i < NUM_ARGS_ON_REGISTER {
                reg_values.push(bits);
            } else {
                let off = (PARAM_AREA_OFFSET + 8 * i as u64) as usize;
                image[off..off + 8].copy_from_slice(&bits.to_le_bytes());
            }

            if let ArgSlot::Buffer { data, max_len, direction } = arg {
                let off = (vemvas[i] - sp) as usize;
                if direction.copies_in() {
                    image[off..off + data.len()].copy_from_slice(data);
                    copied_in = true;
                }
                if direction.copies_out() {
                    copyouts.push(CopyOut { arg_index: i, offset: off, len: *max_len });
                    copied_out = true;
                }
            }
        }

        Ok(BuiltCallArgs { stack_image: image, stack_size, reg_values, copied_in, copied_out, copyouts })
    }
}

#[derive(Debug, Clone)]
struct CopyOut {
    arg_index: usize,
    offset: usize,
    len: usize,
}

/// The result of laying a [`CallArgs`] out against a stack pointer: ready to
/// send as the payload of a CALL/CALL_STKIN/CALL_STKOUT/CALL_STKINOUT frame.
#[derive(Debug, Clone)]
pub struct BuiltCallArgs {
    pub stack_image: Vec<u8>,
    pub stack_size: u64,
    /// Values for the first `min(num_args, NUM_ARGS_ON_REGISTER)` registers.
    pub reg_values: Vec<u64>,
    pub copied_in: bool,
    pub copied_out: bool,
    copyouts: Vec<CopyOut>,
}

impl BuiltCallArgs {
    /// True if any registers or stack slots need sending at all (some calls
    /// have neither: `CmdCode::Call` rather than a `*_STK*` variant).
    pub fn needs_stack_frame(&self) -> bool {
        self.copied_in || self.copied_out
    }

    /// Copies the worker-returned stack image back into the host-side
    /// buffers of every `Out`/`InOut` argument.
    pub fn copyout(&self, returned_image: &[u8], args: &mut CallArgs) -> Result<()> {
        for c in &self.copyouts {
            let end = c.offset + c.len;
            let slice = returned_image
                .get(c.offset..end)
                .ok_or(AveoError::ProtocolViolation("returned stack image too short"))?;
            match args.args.get_mut(c.arg_index) {
                Some(ArgSlot::Buffer { data, .. }) => {
                    data.clear();
                    data.extend_from_slice(slice);
                }
                _ => return Err(AveoError::ProtocolViolation("copyout target is not a buffer")),
            }
        }
        Ok(())
    }
}

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

fn align16(v: u64) -> u64 {
    (v + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_is_just_the_param_area_aligned() {
        let args = CallArgs::new();
        let built = args.build(0x1000).unwrap();
        assert_eq!(built.stack_size, align16(PARAM_AREA_OFFSET));
        assert!(built.reg_values.is_empty());
        assert!(!built.copied_in && !built.copied_out);
    }

    #[test]
    fn scalar_args_stay_in_registers_until_the_ninth() {
        let mut args = CallArgs::new();
        for i in 0..8 {
            args.push_i64(i).unwrap();
        }
        let built = args.build(0).unwrap();
        assert_eq!(built.reg_values.len(), 8);
        assert_eq!(built.stack_size, align16(PARAM_AREA_OFFSET + 8 * 8));

        args.push_i64(99).unwrap();
        let built = args.build(0).unwrap();
        assert_eq!(built.reg_values.len(), 8, "ninth arg must not land in a register");
        let off = (PARAM_AREA_OFFSET + 8 * 8) as usize;
        let v = u64::from_le_bytes(built.stack_image[off..off + 8].try_into().unwrap());
        assert_eq!(v as i64, 99);
    }

    #[test]
    fn float_is_packed_into_high_half() {
        let mut args = CallArgs::new();
        args.push_f32(1.5f32).unwrap();
        let built = args.build(0).unwrap();
        let bits = built.reg_values[0];
        assert_eq!(bits & 0xFFFF_FFFF, 0);
        assert_eq!((bits >> 32) as u32, 1.5f32.to_bits());
    }

    #[test]
    fn double_occupies_full_slot() {
        let mut args = CallArgs::new();
        args.push_f64(std::f64::consts::PI).unwrap();
        let built = args.build(0).unwrap();
        assert_eq!(f64::from_bits(built.reg_values[0]), std::f64::consts::PI);
    }

    #[test]
    fn in_buffer_is_written_and_out_buffer_round_trips() {
        let mut args = CallArgs::new();
        args.push_stack_buffer(b"payload".to_vec(), 16, Direction::In).unwrap();
        args.push_stack_buffer(vec![0u8; 8], 8, Direction::Out).unwrap();
        let sp = 0x2000;
        let built = args.build(sp).unwrap();
        assert!(built.copied_in);
        assert!(built.copied_out);

        let mut returned = built.stack_image.clone();
        // simulate the worker writing a result into the Out buffer's region
        let out_vemva = sp + PARAM_AREA_OFFSET + 8 * 2 + align8(16);
        let out_off = (out_vemva - sp) as usize;
        returned[out_off..out_off + 4].copy_from_slice(&[9, 9, 9, 9]);

        built.copyout(&returned, &mut args).unwrap();
        assert_eq!(args.stack_buffer(1).unwrap()[..4], [9, 9, 9, 9]);
    }

    #[test]
    fn narrow_signed_widths_sign_extend() {
        let mut args = CallArgs::new();
        args.push_int8(-1i8).unwrap();
        args.push_int16(-1i16).unwrap();
        args.push_int32(-1i32).unwrap();
        let built = args.build(0).unwrap();
        assert!(built.reg_values.iter().all(|&v| v == u64::MAX));
    }

    #[test]
    fn narrow_unsigned_widths_zero_extend() {
        let mut args = CallArgs::new();
        args.push_uint8(0xffu8).unwrap();
        args.push_uint16(0xffffu16).unwrap();
        args.push_uint32(0xffff_ffffu32).unwrap();
        let built = args.build(0).unwrap();
        assert_eq!(built.reg_values, vec![0xff, 0xffff, 0xffff_ffff]);
    }

    #[test]
    fn rejects_oversized_argument_lists() {
        let mut args = CallArgs::new();
        for i in 0..MAX_NUM_ARGS {
            args.push_i64(i as i64).unwrap();
        }
        assert!(args.push_i64(0).is_err());
    }

    #[test]
    fn rejects_buffer_longer_than_max_len() {
        let mut args = CallArgs::new();
        assert!(args.push_stack_buffer(vec![0u8; 10], 4, Direction::In).is_err());
    }
}
