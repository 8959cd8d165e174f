//! KeyedStore 二进制容器
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ MAGIC        (8 bytes) "SYSTOUT\0"│
//! │ version      (u32 LE) = 1        │
//! │ codec        (u8)                │
//! │ uncomp_size  (u32 LE)            │
//! │ payload_size (u32 LE)            │
//! │ payload      (compressed)        │
//! │ CRC32        (u32 LE, payload)   │
//! │ MAGIC        (8 bytes)           │
//! └──────────────────────────────────┘
//! ```
//!
//! 解压后的负载：
//!
//! ```text
//! entry_count (u32) { dir (str) | name (str) | kind (u8) | object }*
//! str       = len (u32) + UTF-8 bytes
//! histogram = naxes (u8) { nbins (u32) min (f64) max (f64) }* entries (u64)
//!             nbins_total (u32) contents (f64)* sumw2 (f64)*
//! cutflow   = nstages (u32) { label (str) sum_weight (f64) sum_weight_squared (f64) }*
//! ```

use std::io::{Cursor, Read};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crate::aggregation::{Cutflow, CutflowStage};
use crate::common::{Result, SystError};
use crate::histogram::{total_bins, Axis, Histogram};
use super::compression::{self, Codec};
use super::{KeyedStore, StoredObject};

const MAGIC: &[u8; 8] = b"SYSTOUT\0";
const VERSION: u32     = 1;
/// MAGIC + version + codec + 两个长度 + CRC + MAGIC
const FRAME_OVERHEAD: usize = 8 + 4 + 1 + 4 + 4 + 4 + 8;

const KIND_HISTOGRAM: u8 = 1;
const KIND_CUTFLOW:   u8 = 2;

pub fn encode(store: &KeyedStore, codec: Codec) -> Result<Vec<u8>> {
    let body       = encode_body(store)?;
    let compressed = compression::compress(&body, codec)?;

    let mut out = Vec::with_capacity(compressed.len() + FRAME_OVERHEAD);
    out.extend_from_slice(MAGIC);
    out.write_u32::<LittleEndian>(VERSION).map_err(io_err)?;
    out.write_u8(codec.tag()).map_err(io_err)?;
    out.write_u32::<LittleEndian>(len_u32(body.len())?).map_err(io_err)?;
    out.write_u32::<LittleEndian>(len_u32(compressed.len())?).map_err(io_err)?;
    out.extend_from_slice(&compressed);
    out.write_u32::<LittleEndian>(crc32fast::hash(&compressed)).map_err(io_err)?;
    out.extend_from_slice(MAGIC);
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<KeyedStore> {
    let n = data.len();
    if n < FRAME_OVERHEAD || &data[..8] != MAGIC || &data[n - 8..] != MAGIC {
        return Err(SystError::Sink("invalid container magic".into()));
    }
    let mut header = Cursor::new(&data[8..n - 8]);
    let version = header.read_u32::<LittleEndian>().map_err(io_err)?;
    if version != VERSION {
        return Err(SystError::Sink(format!("unsupported container version {version}")));
    }
    let codec        = Codec::from_tag(header.read_u8().map_err(io_err)?)?;
    let uncomp_size  = header.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let payload_size = header.read_u32::<LittleEndian>().map_err(io_err)? as usize;

    // 头部 21 字节之后是负载，随后 4 字节 CRC
    let start = 8 + 4 + 1 + 4 + 4;
    if start + payload_size + 4 + 8 != n {
        return Err(SystError::ChecksumMismatch);
    }
    let payload    = &data[start..start + payload_size];
    let stored_crc = Cursor::new(&data[start + payload_size..n - 8])
        .read_u32::<LittleEndian>()
        .map_err(io_err)?;
    if crc32fast::hash(payload) != stored_crc {
        return Err(SystError::ChecksumMismatch);
    }

    let body = compression::decompress(payload, codec, uncomp_size)?;
    decode_body(&body)
}

// ── 负载 ──────────────────────────────────────────────────────────────────────

fn encode_body(store: &KeyedStore) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(len_u32(store.len())?).map_err(io_err)?;
    for (dir, name, object) in store.iter() {
        write_str(&mut buf, dir)?;
        write_str(&mut buf, name)?;
        match object {
            StoredObject::Histogram(h) => {
                buf.write_u8(KIND_HISTOGRAM).map_err(io_err)?;
                write_histogram(&mut buf, h)?;
            }
            StoredObject::Cutflow(c) => {
                buf.write_u8(KIND_CUTFLOW).map_err(io_err)?;
                buf.write_u32::<LittleEndian>(len_u32(c.stages.len())?).map_err(io_err)?;
                for s in &c.stages {
                    write_str(&mut buf, &s.label)?;
                    buf.write_f64::<LittleEndian>(s.sum_weight).map_err(io_err)?;
                    buf.write_f64::<LittleEndian>(s.sum_weight_squared).map_err(io_err)?;
                }
            }
        }
    }
    Ok(buf)
}

fn write_histogram(buf: &mut Vec<u8>, h: &Histogram) -> Result<()> {
    buf.write_u8(h.axes.len() as u8).map_err(io_err)?;
    for a in &h.axes {
        buf.write_u32::<LittleEndian>(len_u32(a.nbins)?).map_err(io_err)?;
        buf.write_f64::<LittleEndian>(a.min).map_err(io_err)?;
        buf.write_f64::<LittleEndian>(a.max).map_err(io_err)?;
    }
    buf.write_u64::<LittleEndian>(h.entries).map_err(io_err)?;
    buf.write_u32::<LittleEndian>(len_u32(h.contents.len())?).map_err(io_err)?;
    for &v in h.contents.iter().chain(&h.sumw2) {
        buf.write_f64::<LittleEndian>(v).map_err(io_err)?;
    }
    Ok(())
}

fn decode_body(body: &[u8]) -> Result<KeyedStore> {
    let mut cur   = Cursor::new(body);
    let count     = cur.read_u32::<LittleEndian>().map_err(io_err)?;
    let mut store = KeyedStore::new();
    for _ in 0..count {
        let dir  = read_str(&mut cur)?;
        let name = read_str(&mut cur)?;
        let object = match cur.read_u8().map_err(io_err)? {
            KIND_HISTOGRAM => StoredObject::Histogram(read_histogram(&mut cur)?),
            KIND_CUTFLOW   => {
                let n = cur.read_u32::<LittleEndian>().map_err(io_err)?;
                let mut stages = Vec::new();
                for _ in 0..n {
                    let label = read_str(&mut cur)?;
                    let w     = cur.read_f64::<LittleEndian>().map_err(io_err)?;
                    let w2    = cur.read_f64::<LittleEndian>().map_err(io_err)?;
                    stages.push(CutflowStage::new(&label, w, w2));
                }
                StoredObject::Cutflow(Cutflow::new(stages))
            }
            k => return Err(SystError::Sink(format!("unknown object kind {k}"))),
        };
        store.put(&dir, &name, object)?;
    }
    if cur.position() as usize != body.len() {
        return Err(SystError::Sink("trailing bytes after last entry".into()));
    }
    Ok(store)
}

fn read_histogram(cur: &mut Cursor<&[u8]>) -> Result<Histogram> {
    let naxes = cur.read_u8().map_err(io_err)?;
    let mut axes = Vec::with_capacity(naxes as usize);
    for _ in 0..naxes {
        let nbins = cur.read_u32::<LittleEndian>().map_err(io_err)? as usize;
        let min   = cur.read_f64::<LittleEndian>().map_err(io_err)?;
        let max   = cur.read_f64::<LittleEndian>().map_err(io_err)?;
        axes.push(Axis::new(nbins, min, max));
    }
    let expected = total_bins(&axes).map_err(|e| SystError::Sink(e.to_string()))?;
    let entries  = cur.read_u64::<LittleEndian>().map_err(io_err)?;
    let bins     = cur.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    if bins != expected {
        return Err(SystError::Sink(format!("{bins} bins stored, binning implies {expected}")));
    }
    // contents 与 sumw2 各 bins 个 f64，先确认负载里有这么多字节再分配
    let remaining = cur.get_ref().len().saturating_sub(cur.position() as usize);
    if bins.checked_mul(16).map_or(true, |need| need > remaining) {
        return Err(SystError::Sink(format!("{bins} bins exceed payload")));
    }
    let mut h = Histogram::new(axes).map_err(|e| SystError::Sink(e.to_string()))?;
    h.entries = entries;
    cur.read_f64_into::<LittleEndian>(&mut h.contents).map_err(io_err)?;
    cur.read_f64_into::<LittleEndian>(&mut h.sumw2).map_err(io_err)?;
    Ok(h)
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    buf.write_u32::<LittleEndian>(len_u32(s.len())?).map_err(io_err)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cur.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let remaining = cur.get_ref().len().saturating_sub(cur.position() as usize);
    if len > remaining {
        return Err(SystError::Sink(format!("string of {len} bytes exceeds payload")));
    }
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes).map_err(io_err)?;
    String::from_utf8(bytes).map_err(|e| SystError::Sink(e.to_string()))
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| SystError::Sink(format!("length {len} exceeds u32")))
}

fn io_err(e: std::io::Error) -> SystError {
    SystError::Sink(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> KeyedStore {
        let mut h = Histogram::new(vec![Axis::new(3, 0.0, 3.0), Axis::new(2, -1.0, 1.0)]).unwrap();
        h.fill(&[0.5, 0.5], 2.0);
        h.fill(&[2.5, -0.5], 1.5);
        let mut store = KeyedStore::new();
        store.put("NOSYS", "pt_vs_eta_SR", StoredObject::Histogram(h)).unwrap();
        store.put("", "Cutflow_main", StoredObject::Cutflow(Cutflow::new(vec![
            CutflowStage::new("Initial", 10.0, 12.0),
            CutflowStage::new("SelA", 4.0, 5.0),
        ]))).unwrap();
        store
    }

    #[test]
    fn container_restores_store() {
        let store = sample_store();
        for codec in [Codec::Lz4, Codec::None] {
            let bytes = encode(&store, codec).unwrap();
            assert_eq!(decode(&bytes).unwrap(), store);
        }
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut bytes = encode(&sample_store(), Codec::Lz4).unwrap();
        bytes[8 + 4 + 1 + 4 + 4] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(SystError::ChecksumMismatch)));
    }

    fn body_with_axes(axes: &[(u32, f64, f64)], bins: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(1).unwrap();
        write_str(&mut body, "NOSYS").unwrap();
        write_str(&mut body, "h").unwrap();
        body.write_u8(KIND_HISTOGRAM).unwrap();
        body.write_u8(axes.len() as u8).unwrap();
        for &(nbins, min, max) in axes {
            body.write_u32::<LittleEndian>(nbins).unwrap();
            body.write_f64::<LittleEndian>(min).unwrap();
            body.write_f64::<LittleEndian>(max).unwrap();
        }
        body.write_u64::<LittleEndian>(0).unwrap();
        body.write_u32::<LittleEndian>(bins).unwrap();
        body
    }

    #[test]
    fn oversized_binning_is_rejected_before_allocation() {
        let overflow = body_with_axes(&[(u32::MAX, 0.0, 1.0); 3], 0);
        assert!(matches!(decode_body(&overflow), Err(SystError::Sink(_))));

        // 声明的 bin 数与轴一致，但负载里没有对应的数据
        let nbins = 1u32 << 28;
        let unbacked = body_with_axes(&[(nbins, 0.0, 1.0)], nbins + 2);
        assert!(matches!(decode_body(&unbacked), Err(SystError::Sink(_))));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.write_u32::<LittleEndian>(VERSION).unwrap();
        bytes.write_u8(Codec::None.tag()).unwrap();
        bytes.write_u32::<LittleEndian>(unbacked.len() as u32).unwrap();
        bytes.write_u32::<LittleEndian>(unbacked.len() as u32).unwrap();
        bytes.extend_from_slice(&unbacked);
        bytes.write_u32::<LittleEndian>(crc32fast::hash(&unbacked)).unwrap();
        bytes.extend_from_slice(MAGIC);
        assert!(matches!(decode(&bytes), Err(SystError::Sink(_))));
    }

    #[test]
    fn truncated_container_is_rejected() {
        let bytes = encode(&sample_store(), Codec::Lz4).unwrap();
        assert!(matches!(decode(&bytes[..bytes.len() - 3]), Err(SystError::Sink(_))));
        assert!(decode(&bytes[..10]).is_err());
    }
}
