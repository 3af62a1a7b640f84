use std::io;

/// Writes a value as the body of a frame.
///
/// Implementors put their header and any small body into `buf` and may hand back a
/// borrowed tail, which the sender writes right after `buf` without copying it.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}

/// Reads a value out of a frame body, possibly borrowing from it.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}

/// Element types a receive buffer can be made of.
///
/// They're all aligned to at least 4 bytes, so an `f32` payload can be viewed in place
/// instead of being copied out of the buffer.
pub trait FrameWord: bytemuck::Pod {}

impl FrameWord for u32 {}
impl FrameWord for i32 {}
impl FrameWord for f32 {}
impl FrameWord for u64 {}
impl FrameWord for i64 {}
impl FrameWord for f64 {}
