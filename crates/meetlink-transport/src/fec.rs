//! # FEC Coder: Systematic Reed-Solomon Blocks
//!
//! Each protected payload becomes one block of `K` source symbols (the
//! payload itself, zero-padded) followed by `R` repair symbols. The code is
//! MDS: any `K` distinct symbols of the `K + R` reconstruct the payload.
//!
//! ## Symbol layout
//!
//! ```text
//! | index (16, BE) | symbol bytes (symbol_size) |
//! ```
//!
//! Indices `0..K` are source symbols, `K..K+R` repair symbols. The block's
//! parameters travel in every FEC packet header as a [`FecConfig`].
//!
//! Senders decide whether to protect a packet with [`FecPolicy`]; receivers
//! collect symbols per block with [`FecAssembler`].

use bytes::{BufMut, Bytes, BytesMut};
use quanta::Instant;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;

use crate::wire::{FecConfig, FrameType, Packet};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Symbol sizes are rounded up to this many bytes.
pub const SYMBOL_ALIGNMENT: u8 = 64;

/// Largest source symbol count a block may carry (fits `source_blocks: u8`).
pub const MAX_SOURCE_SYMBOLS: usize = u8::MAX as usize;

/// Symbol index prefix.
pub const SYMBOL_INDEX_LEN: usize = 2;

/// Largest aligned symbol size representable in the u16 header field.
const MAX_SYMBOL_SIZE: usize = (u16::MAX as usize / SYMBOL_ALIGNMENT as usize) * SYMBOL_ALIGNMENT as usize;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FecError {
    #[error("insufficient symbols: have {have}, need {need}")]
    InsufficientSymbols { have: usize, need: usize },
    #[error("invalid FEC config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid FEC symbol: {0}")]
    InvalidSymbol(&'static str),
    #[error("erasure coder failed: {0}")]
    Coder(String),
}

// ─── Coder ───────────────────────────────────────────────────────────────────

/// Result of encoding one payload.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub config: FecConfig,
    /// Serialized symbols: source first, then repair.
    pub symbols: Vec<Bytes>,
}

impl EncodedBlock {
    /// The packed 14-byte config.
    pub fn config_bytes(&self) -> [u8; FecConfig::ENCODED_LEN] {
        self.config.to_bytes()
    }
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Split `payload` into source symbols and add `redundancy` repair symbols.
///
/// `symbol_size` is a preferred size; it is aligned up and grown when the
/// payload would otherwise need more than [`MAX_SOURCE_SYMBOLS`] symbols.
pub fn encode(payload: &[u8], symbol_size: u16, redundancy: u32) -> Result<EncodedBlock, FecError> {
    if symbol_size == 0 {
        return Err(FecError::InvalidConfig("symbol size must be non-zero"));
    }
    let redundancy =
        u16::try_from(redundancy).map_err(|_| FecError::InvalidConfig("redundancy exceeds u16"))?;

    let align = SYMBOL_ALIGNMENT as usize;
    let min_for_count = payload.len().div_ceil(MAX_SOURCE_SYMBOLS);
    let size = align_up((symbol_size as usize).max(min_for_count).max(1), align);
    if size > MAX_SYMBOL_SIZE {
        return Err(FecError::InvalidConfig("payload too large for one block"));
    }
    let k = payload.len().div_ceil(size).max(1);

    let source: Vec<Vec<u8>> = (0..k)
        .map(|i| {
            let start = (i * size).min(payload.len());
            let end = ((i + 1) * size).min(payload.len());
            let mut shard = vec![0u8; size];
            shard[..end - start].copy_from_slice(&payload[start..end]);
            shard
        })
        .collect();

    let repair = if redundancy > 0 {
        reed_solomon_simd::encode(k, redundancy as usize, &source)
            .map_err(|e| FecError::Coder(e.to_string()))?
    } else {
        Vec::new()
    };

    let config = FecConfig {
        transfer_length: payload.len() as u64,
        symbol_size: size as u16,
        source_blocks: k as u8,
        sub_blocks: redundancy,
        alignment: SYMBOL_ALIGNMENT,
    };

    let symbols = source
        .iter()
        .chain(repair.iter())
        .enumerate()
        .map(|(idx, shard)| serialize_symbol(idx as u16, shard))
        .collect();

    Ok(EncodedBlock { config, symbols })
}

fn serialize_symbol(index: u16, shard: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SYMBOL_INDEX_LEN + shard.len());
    buf.put_u16(index);
    buf.extend_from_slice(shard);
    buf.freeze()
}

/// Split a serialized symbol into `(index, shard)`.
pub fn parse_symbol(symbol: &[u8]) -> Result<(u16, &[u8]), FecError> {
    if symbol.len() < SYMBOL_INDEX_LEN {
        return Err(FecError::InvalidSymbol("missing index"));
    }
    let index = u16::from_be_bytes([symbol[0], symbol[1]]);
    Ok((index, &symbol[SYMBOL_INDEX_LEN..]))
}

fn validate(config: &FecConfig) -> Result<(), FecError> {
    if config.source_blocks == 0 {
        return Err(FecError::InvalidConfig("zero source symbols"));
    }
    if config.symbol_size == 0 {
        return Err(FecError::InvalidConfig("zero symbol size"));
    }
    let capacity = config.source_blocks as u64 * config.symbol_size as u64;
    if config.transfer_length > capacity {
        return Err(FecError::InvalidConfig("transfer length exceeds block"));
    }
    Ok(())
}

/// Reconstruct a payload from the packed config and any set of symbols.
pub fn decode<S: AsRef<[u8]>>(config_bytes: &[u8], symbols: &[S]) -> Result<Bytes, FecError> {
    let config = FecConfig::from_bytes(config_bytes)
        .ok_or(FecError::InvalidConfig("config shorter than 14 bytes"))?;
    decode_block(&config, symbols.iter().map(|s| s.as_ref()))
}

/// Reconstruct a payload from a parsed config and serialized symbols.
pub fn decode_block<'a>(
    config: &FecConfig,
    symbols: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Bytes, FecError> {
    validate(config)?;
    let k = config.source_blocks as usize;
    let r = config.sub_blocks as usize;
    let size = config.symbol_size as usize;

    let mut original: HashMap<usize, &[u8]> = HashMap::new();
    let mut recovery: HashMap<usize, &[u8]> = HashMap::new();
    for symbol in symbols {
        let (index, shard) = parse_symbol(symbol)?;
        if shard.len() != size {
            return Err(FecError::InvalidSymbol("symbol size mismatch"));
        }
        let index = index as usize;
        if index < k {
            original.entry(index).or_insert(shard);
        } else if index < k + r {
            recovery.entry(index - k).or_insert(shard);
        } else {
            return Err(FecError::InvalidSymbol("index outside block"));
        }
    }

    let have = original.len() + recovery.len();
    if have < k {
        return Err(FecError::InsufficientSymbols { have, need: k });
    }

    let restored = if original.len() < k {
        reed_solomon_simd::decode(
            k,
            r,
            original.iter().map(|(i, s)| (*i, *s)),
            recovery.iter().map(|(i, s)| (*i, *s)),
        )
        .map_err(|e| FecError::Coder(e.to_string()))?
    } else {
        std::collections::BTreeMap::new()
    };

    let mut out = BytesMut::with_capacity(k * size);
    for i in 0..k {
        match original.get(&i) {
            Some(shard) => out.extend_from_slice(shard),
            None => {
                let shard = restored
                    .get(&i)
                    .ok_or_else(|| FecError::Coder(format!("source symbol {i} not restored")))?;
                out.extend_from_slice(shard);
            }
        }
    }
    out.truncate(config.transfer_length as usize);
    Ok(out.freeze())
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// When and how much redundancy to add.
#[derive(Debug, Clone, PartialEq)]
pub struct FecPolicy {
    pub enabled: bool,
    /// Preferred symbol size in bytes.
    pub symbol_size: u16,
    /// Payloads at or below this length are sent unprotected (config packets excepted).
    pub min_payload_len: usize,
    /// Repair symbols per source symbol.
    pub ratio: f64,
    pub min_repair: u32,
    pub max_repair: u32,
    /// Floor applied to config packets regardless of size.
    pub min_config_repair: u32,
}

impl Default for FecPolicy {
    fn default() -> Self {
        FecPolicy {
            enabled: true,
            symbol_size: 1024,
            min_payload_len: 1024,
            ratio: 0.25,
            min_repair: 1,
            max_repair: 10,
            min_config_repair: 3,
        }
    }
}

impl FecPolicy {
    /// Repair symbol count for this frame, or `None` to send it unprotected.
    pub fn redundancy_for(&self, frame_type: FrameType, payload_len: usize) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let is_config = frame_type == FrameType::Config;
        if !is_config && !frame_type.is_key() {
            return None;
        }
        if !is_config && payload_len <= self.min_payload_len {
            return None;
        }

        let symbols = payload_len.div_ceil(self.symbol_size.max(1) as usize).max(1);
        let computed = (symbols as f64 * self.ratio).ceil() as u32;
        let redundancy = computed.clamp(self.min_repair, self.max_repair);
        Some(if is_config {
            redundancy.max(self.min_config_repair)
        } else {
            redundancy
        })
    }
}

// ─── Assembler ───────────────────────────────────────────────────────────────

/// Outcome of feeding one symbol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyEvent {
    /// The block was reconstructed.
    Recovered {
        block: u32,
        frame_type: FrameType,
        payload: Bytes,
    },
    /// Symbol stored; more are needed.
    Pending,
    /// Symbol belongs to a block already reconstructed or dropped.
    Stale,
}

#[derive(Debug)]
struct BlockState {
    config: FecConfig,
    frame_type: FrameType,
    symbols: HashMap<u16, Bytes>,
    first_seen: Instant,
}

/// Receive-side buffer that collects symbols until each block decodes.
///
/// Blocks are keyed by their base sequence (`packet.sequence - symbol index`),
/// which is unique per block because a block's symbols are sent with
/// consecutive sequence numbers. A block whose window closes (too old, or
/// evicted by newer blocks) is dropped; its late symbols are ignored.
pub struct FecAssembler {
    window: Duration,
    max_blocks: usize,
    blocks: HashMap<u32, BlockState>,
    order: VecDeque<u32>,
    finished: VecDeque<u32>,
    pub blocks_recovered: u64,
    pub blocks_dropped: u64,
}

impl FecAssembler {
    const FINISHED_MEMORY: usize = 64;

    pub fn new(window: Duration, max_blocks: usize) -> Self {
        FecAssembler {
            window,
            max_blocks: max_blocks.max(1),
            blocks: HashMap::new(),
            order: VecDeque::new(),
            finished: VecDeque::new(),
            blocks_recovered: 0,
            blocks_dropped: 0,
        }
    }

    /// Feed an FEC packet. Non-FEC packets are rejected as invalid.
    pub fn push(&mut self, packet: &Packet) -> Result<AssemblyEvent, FecError> {
        self.push_at(packet, Instant::now())
    }

    fn push_at(&mut self, packet: &Packet, now: Instant) -> Result<AssemblyEvent, FecError> {
        let config = packet
            .fec
            .ok_or(FecError::InvalidSymbol("packet carries no FEC config"))?;
        validate(&config)?;
        let (index, _) = parse_symbol(&packet.payload)?;
        let block = packet.sequence.wrapping_sub(index as u32);

        self.expire_at(now);

        if self.finished.contains(&block) {
            return Ok(AssemblyEvent::Stale);
        }

        if !self.blocks.contains_key(&block) {
            while self.blocks.len() >= self.max_blocks {
                match self.order.pop_front() {
                    Some(oldest) => self.drop_block(oldest, "evicted"),
                    None => break,
                }
            }
            self.blocks.insert(
                block,
                BlockState {
                    config,
                    frame_type: packet.frame_type,
                    symbols: HashMap::new(),
                    first_seen: now,
                },
            );
            self.order.push_back(block);
        }

        let Some(state) = self.blocks.get_mut(&block) else {
            return Ok(AssemblyEvent::Pending);
        };
        if state.config != config {
            return Err(FecError::InvalidSymbol("config differs within block"));
        }
        state.symbols.entry(index).or_insert_with(|| packet.payload.clone());

        if state.symbols.len() < config.source_blocks as usize {
            return Ok(AssemblyEvent::Pending);
        }

        let result = decode_block(&state.config, state.symbols.values().map(|s| &s[..]));
        let frame_type = state.frame_type;
        match result {
            Ok(payload) => {
                self.finish(block);
                self.blocks_recovered += 1;
                Ok(AssemblyEvent::Recovered {
                    block,
                    frame_type,
                    payload,
                })
            }
            Err(FecError::InsufficientSymbols { .. }) => Ok(AssemblyEvent::Pending),
            Err(e) => {
                self.drop_block(block, "undecodable");
                Err(e)
            }
        }
    }

    /// Drop blocks whose window has closed.
    pub fn expire(&mut self) {
        self.expire_at(Instant::now());
    }

    fn expire_at(&mut self, now: Instant) {
        while let Some(&oldest) = self.order.front() {
            let expired = self
                .blocks
                .get(&oldest)
                .map(|b| now.saturating_duration_since(b.first_seen) > self.window)
                .unwrap_or(true);
            if !expired {
                break;
            }
            self.order.pop_front();
            self.drop_block(oldest, "window closed");
        }
    }

    fn finish(&mut self, block: u32) {
        self.blocks.remove(&block);
        self.order.retain(|b| *b != block);
        self.finished.push_back(block);
        if self.finished.len() > Self::FINISHED_MEMORY {
            self.finished.pop_front();
        }
    }

    fn drop_block(&mut self, block: u32, reason: &'static str) {
        if let Some(state) = self.blocks.remove(&block) {
            self.blocks_dropped += 1;
            tracing::debug!(
                block,
                symbols = state.symbols.len(),
                needed = state.config.source_blocks,
                reason,
                "dropping unrecovered FEC block"
            );
        }
        self.order.retain(|b| *b != block);
        self.finished.push_back(block);
        if self.finished.len() > Self::FINISHED_MEMORY {
            self.finished.pop_front();
        }
    }

    /// Blocks still waiting for symbols.
    pub fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for FecAssembler {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 16)
    }
}

/// Wrap every symbol of a block in FEC packets with consecutive sequences.
///
/// `next_seq` is called once per symbol so the caller's channel counter stays
/// authoritative.
pub fn packetize(
    block: &EncodedBlock,
    frame_type: FrameType,
    mut next_seq: impl FnMut() -> u32,
) -> Vec<Bytes> {
    block
        .symbols
        .iter()
        .map(|symbol| crate::wire::encode_fec(symbol, next_seq(), frame_type, &block.config))
        .collect()
}
