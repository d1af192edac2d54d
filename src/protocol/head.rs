//! The packed wire header that precedes every message.
//!
//! Integer fields are big-endian on the wire; `lambda` and `confidence` are
//! transmitted in host byte order (the cluster is assumed to be homogeneous
//! little-endian, see the crate docs).

use bytes::{Buf, BufMut, BytesMut};

/// First two header bytes, `"MF"`.
pub const HEAD_MAGIC: u16 = 0x4D46;
/// Wire format version.
pub const HEAD_VERSION: u8 = 0x01;
/// Size of the packed header in bytes.
pub const HEAD_LEN: usize = 44;

/// Message types exchanged between the scheduler, labors and submitters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// submitter -> scheduler, payload is the task file path
    SubmitTask = 1,
    SubmitTaskRsp = 2,
    /// labor -> scheduler on startup
    AttachLabor = 3,
    AttachLaborRsp = 4,
    /// scheduler -> labor, payload is the full rating dataset
    PushRate = 5,
    PushRateRsp = 6,
    /// scheduler -> labor, payload is the fixed-side factor matrix
    PushFixed = 7,
    PushFixedRsp = 8,
    /// scheduler -> labor, assign one bucket
    Calc = 9,
    /// labor -> scheduler, payload is the updated factor rows
    CalcRsp = 10,
    /// scheduler -> labor liveness probe
    HeartBeat = 11,
    /// labor -> scheduler, carries the labor's current (taskid, epoch)
    InfoRsp = 12,
    Unspecified = 100,
}

impl OpCode {
    pub fn from_u8(raw: u8) -> OpCode {
        match raw {
            1 => OpCode::SubmitTask,
            2 => OpCode::SubmitTaskRsp,
            3 => OpCode::AttachLabor,
            4 => OpCode::AttachLaborRsp,
            5 => OpCode::PushRate,
            6 => OpCode::PushRateRsp,
            7 => OpCode::PushFixed,
            8 => OpCode::PushFixedRsp,
            9 => OpCode::Calc,
            10 => OpCode::CalcRsp,
            11 => OpCode::HeartBeat,
            12 => OpCode::InfoRsp,
            _ => OpCode::Unspecified,
        }
    }
}

/// The fixed-size header preceding every payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Head {
    pub magic: u16,
    pub version: u8,
    pub opcode: u8,
    /// Monotonically increasing task counter on the scheduler
    pub taskid: u32,
    /// Half-epoch counter within a task; odd solves users, even solves items
    pub epochid: u32,
    pub nfactors: u32,
    /// Bucket index for `Calc`/`CalcRsp`
    pub bucket: u32,
    /// Regularization lambda
    pub lambda: f64,
    /// Confidence weight alpha
    pub confidence: f64,
    /// Payload length in bytes, not including the header; always > 0
    pub length: u64,
}

impl Head {
    pub fn new(code: OpCode) -> Self {
        Head {
            magic: HEAD_MAGIC,
            version: HEAD_VERSION,
            opcode: code as u8,
            taskid: 0,
            epochid: 0,
            nfactors: 0,
            bucket: 0,
            lambda: 0.0,
            confidence: 0.0,
            length: 0,
        }
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::from_u8(self.opcode)
    }

    /// `true` iff magic, version, length and opcode are all acceptable.
    pub fn validate(&self) -> bool {
        self.magic == HEAD_MAGIC
            && self.version == HEAD_VERSION
            && self.length > 0
            && self.opcode != OpCode::Unspecified as u8
    }

    /// Append the header to `dst` in wire order.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEAD_LEN);
        dst.put_u16(self.magic);
        dst.put_u8(self.version);
        dst.put_u8(self.opcode);
        dst.put_u32(self.taskid);
        dst.put_u32(self.epochid);
        dst.put_u32(self.nfactors);
        dst.put_u32(self.bucket);
        dst.put_f64_ne(self.lambda);
        dst.put_f64_ne(self.confidence);
        dst.put_u64(self.length);
    }

    /// Consume `HEAD_LEN` bytes from `src`. The caller must have checked
    /// that at least `HEAD_LEN` bytes are available.
    pub fn read_from(src: &mut BytesMut) -> Head {
        debug_assert!(src.len() >= HEAD_LEN);
        Head {
            magic: src.get_u16(),
            version: src.get_u8(),
            opcode: src.get_u8(),
            taskid: src.get_u32(),
            epochid: src.get_u32(),
            nfactors: src.get_u32(),
            bucket: src.get_u32(),
            lambda: src.get_f64_ne(),
            confidence: src.get_f64_ne(),
            length: src.get_u64(),
        }
    }

    /// One-line rendering for diagnostics.
    pub fn dump(&self) -> String {
        format!(
            "magic:{:#x}, version:{:#x}, opcode:{}, taskid:{}, epochid:{}, \
             nfactors:{}, bucket:{}, lambda:{:.2}, confidence:{:.2}, len:{}",
            self.magic,
            self.version,
            self.opcode,
            self.taskid,
            self.epochid,
            self.nfactors,
            self.bucket,
            self.lambda,
            self.confidence,
            self.length
        )
    }

    /// Short rendering used when logging dispatch progress.
    pub fn stepinfo(&self) -> String {
        format!(
            "{{taskid:{}, epochid:{}, bucket:{}}}",
            self.taskid, self.epochid, self.bucket
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Head {
        let mut h = Head::new(OpCode::Calc);
        h.taskid = 7;
        h.epochid = 3;
        h.nfactors = 16;
        h.bucket = 42;
        h.lambda = 0.05;
        h.confidence = 40.0;
        h.length = 2;
        h
    }

    #[test]
    fn wire_roundtrip() {
        let h = sample();
        let mut buf = BytesMut::new();
        h.write_to(&mut buf);
        assert_eq!(buf.len(), HEAD_LEN);
        let back = Head::read_from(&mut buf);
        assert_eq!(h, back);
        assert!(buf.is_empty());
    }

    #[test]
    fn integer_fields_are_big_endian() {
        let h = sample();
        let mut buf = BytesMut::new();
        h.write_to(&mut buf);
        // magic "MF" leads the stream
        assert_eq!(&buf[0..2], &[0x4D, 0x46]);
        // taskid = 7 at offset 4
        assert_eq!(&buf[4..8], &[0, 0, 0, 7]);
        // length = 2 in the trailing u64
        assert_eq!(&buf[HEAD_LEN - 8..], &[0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn validation_table() {
        let ok = sample();
        assert!(ok.validate());

        let mut bad = sample();
        bad.magic = 0x4D47;
        assert!(!bad.validate());

        let mut bad = sample();
        bad.version = 2;
        assert!(!bad.validate());

        let mut bad = sample();
        bad.length = 0;
        assert!(!bad.validate());

        let mut bad = sample();
        bad.opcode = OpCode::Unspecified as u8;
        assert!(!bad.validate());
    }

    #[test]
    fn opcode_conversions() {
        for raw in 1..=12u8 {
            assert_eq!(OpCode::from_u8(raw) as u8, raw);
        }
        assert_eq!(OpCode::from_u8(100), OpCode::Unspecified);
        assert_eq!(OpCode::from_u8(13), OpCode::Unspecified);
    }
}
