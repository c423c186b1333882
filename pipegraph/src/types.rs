//! Type-id maps.
//!
//! Every peer numbers the type names it knows about in a private,
//! append-only map and announces extensions with `update_types`
//! messages. Type-valued fields inside payloads carry the ids of the
//! *sending* side and are rewritten into the receiving side's ids on
//! arrival; an id the receiver has not been told about makes the
//! message malformed.
//!
//! A fixed set of built-in names occupies the first ids of every map
//! so both sides can talk before the first `update_types` exchange.

use {
    crate::pod::{HEADER_SIZE, PodError, PodType, round_up8},
    std::collections::HashMap,
    thiserror::Error,
};

#[cfg(test)]
mod tests;

/// The invalid type id.
pub const INVALID: u32 = 0;

/// The first id after the built-in table.
pub(crate) fn first_dynamic_id() -> u32 {
    BUILTIN_NAMES.len() as u32 + 1
}

macro_rules! builtin_types {
    ($($const_name:ident = $id:literal, $name:literal;)*) => {
        $(pub const $const_name: u32 = $id;)*

        pub(crate) static BUILTIN_NAMES: &[&str] = &[$($name,)*];

        static BUILTIN_IDS: phf::Map<&'static str, u32> = phf::phf_map! {
            $($name => $id,)*
        };
    };
}

builtin_types! {
    CORE = 1, "PipeGraph:Object:Core";
    REGISTRY = 2, "PipeGraph:Object:Registry";
    CLIENT = 3, "PipeGraph:Object:Client";
    NODE = 4, "PipeGraph:Object:Node";
    LINK = 5, "PipeGraph:Object:Link";
    CLIENT_NODE = 6, "PipeGraph:Object:ClientNode";
    FACTORY = 7, "PipeGraph:Object:Factory";
    MEM_FD = 8, "PipeGraph:Memory:MemFd";
    MEM_DMA_BUF = 9, "PipeGraph:Memory:DmaBuf";
    MEM_PTR = 10, "PipeGraph:Memory:MemPtr";
    MEM_ID = 11, "PipeGraph:Memory:Id";
    FORMAT_AUDIO = 12, "PipeGraph:Format:Audio";
    KEY_AUDIO_FORMAT = 13, "PipeGraph:Format:Audio:format";
    KEY_AUDIO_RATE = 14, "PipeGraph:Format:Audio:rate";
    KEY_AUDIO_CHANNELS = 15, "PipeGraph:Format:Audio:channels";
    AUDIO_F32 = 16, "PipeGraph:AudioFormat:F32";
    AUDIO_S16 = 17, "PipeGraph:AudioFormat:S16";
    PARAM_ENUM_FORMAT = 18, "PipeGraph:Param:EnumFormat";
    PARAM_FORMAT = 19, "PipeGraph:Param:Format";
    PARAM_BUFFERS = 20, "PipeGraph:Param:Buffers";
    KEY_BUFFERS_SIZE = 21, "PipeGraph:Param:Buffers:size";
    KEY_BUFFERS_STRIDE = 22, "PipeGraph:Param:Buffers:stride";
    KEY_BUFFERS_COUNT = 23, "PipeGraph:Param:Buffers:buffers";
    KEY_BUFFERS_ALIGN = 24, "PipeGraph:Param:Buffers:align";
    PARAM_META_ENABLE = 25, "PipeGraph:Param:MetaEnable";
    KEY_META_TYPE = 26, "PipeGraph:Param:MetaEnable:type";
    KEY_META_SIZE = 27, "PipeGraph:Param:MetaEnable:size";
    PARAM_VIDEO_PADDING = 28, "PipeGraph:Param:AllocVideoPadding";
    KEY_VIDEO_PADDING = 29, "PipeGraph:Param:AllocVideoPadding:padding";
    PARAM_LATENCY = 30, "PipeGraph:Param:Latency";
    KEY_LATENCY_DIRECTION = 31, "PipeGraph:Param:Latency:direction";
    KEY_LATENCY_MIN_NS = 32, "PipeGraph:Param:Latency:minNs";
    KEY_LATENCY_MAX_NS = 33, "PipeGraph:Param:Latency:maxNs";
    META_SHARED = 34, "PipeGraph:Meta:Shared";
    META_HEADER = 35, "PipeGraph:Meta:Header";
    COMMAND_PAUSE = 36, "PipeGraph:Command:Node:Pause";
    COMMAND_START = 37, "PipeGraph:Command:Node:Start";
    COMMAND_FLUSH = 38, "PipeGraph:Command:Node:Flush";
    COMMAND_CLOCK_UPDATE = 39, "PipeGraph:Command:Node:ClockUpdate";
}

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("the peer referenced the unknown type id {0}")]
    Unknown(u32),
    #[error("the peer tried to change type id {id} from {old:?} to {new:?}")]
    Reassigned { id: u32, old: String, new: String },
    #[error("type update starts at {got} but the map has {expected} entries")]
    Gap { expected: u32, got: u32 },
    #[error("could not walk the pod")]
    Pod(#[from] PodError),
}

/// One side's append-only map from type id to type name.
pub struct TypeMap {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Default for TypeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeMap {
    pub fn new() -> Self {
        let mut names = vec![String::new()];
        names.extend(BUILTIN_NAMES.iter().map(|n| n.to_string()));
        TypeMap {
            names,
            ids: HashMap::new(),
        }
    }

    /// The id that the next interned name will get.
    pub fn next_id(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        if let Some(id) = BUILTIN_IDS.get(name) {
            return Some(*id);
        }
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        if id == INVALID {
            return None;
        }
        self.names.get(id as usize).map(|n| n.as_str())
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(id) = self.id_of(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Returns the names at ids `from..`, used to build an
    /// `update_types` message announcing everything the peer has not
    /// seen yet.
    pub fn names_from(&self, from: u32) -> &[String] {
        &self.names[from as usize..]
    }
}

/// The translation table for ids allocated by the peer.
pub struct PeerTypes {
    map: Vec<u32>,
}

impl Default for PeerTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTypes {
    pub fn new() -> Self {
        // Built-ins occupy the same ids on every map.
        let map = (0..=BUILTIN_NAMES.len() as u32).collect();
        PeerTypes { map }
    }

    pub fn next_id(&self) -> u32 {
        self.map.len() as u32
    }

    /// Applies an `update_types` message from the peer, interning
    /// unknown names into `own`.
    pub fn update(
        &mut self,
        first_id: u32,
        names: &[String],
        own: &mut TypeMap,
    ) -> Result<(), TypeError> {
        for (i, name) in names.iter().enumerate() {
            let peer_id = first_id + i as u32;
            let own_id = own.intern(name);
            match peer_id.cmp(&(self.map.len() as u32)) {
                std::cmp::Ordering::Less => {
                    // Re-announcements must not change the name.
                    let old = self.map[peer_id as usize];
                    if old != own_id {
                        return Err(TypeError::Reassigned {
                            id: peer_id,
                            old: own.name(old).unwrap_or("").to_string(),
                            new: name.clone(),
                        });
                    }
                }
                std::cmp::Ordering::Equal => self.map.push(own_id),
                std::cmp::Ordering::Greater => {
                    return Err(TypeError::Gap {
                        expected: self.map.len() as u32,
                        got: peer_id,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn translate(&self, peer_id: u32) -> Result<u32, TypeError> {
        if peer_id == INVALID {
            return Ok(INVALID);
        }
        self.map
            .get(peer_id as usize)
            .copied()
            .ok_or(TypeError::Unknown(peer_id))
    }
}

/// Rewrites every type-valued field of an encoded pod through `tr`:
/// id values, array items of id type, object types, prop keys and
/// id-typed prop values.
pub fn translate_pod(
    data: &[u8],
    tr: &impl Fn(u32) -> Result<u32, TypeError>,
) -> Result<Vec<u8>, TypeError> {
    let mut out = data.to_vec();
    let end = out.len();
    translate_range(&mut out, 0, end, tr)?;
    Ok(out)
}

fn get_u32(data: &[u8], offset: usize) -> Result<u32, TypeError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(PodError::Truncated)?
        .try_into()
        .unwrap();
    Ok(u32::from_ne_bytes(bytes))
}

fn patch_u32(
    data: &mut [u8],
    offset: usize,
    tr: &impl Fn(u32) -> Result<u32, TypeError>,
) -> Result<(), TypeError> {
    let old = get_u32(data, offset)?;
    let new = tr(old)?;
    data[offset..offset + 4].copy_from_slice(&new.to_ne_bytes());
    Ok(())
}

fn translate_range(
    data: &mut Vec<u8>,
    mut offset: usize,
    end: usize,
    tr: &impl Fn(u32) -> Result<u32, TypeError>,
) -> Result<(), TypeError> {
    while offset + HEADER_SIZE <= end {
        let size = get_u32(data, offset)? as usize;
        let raw_ty = get_u32(data, offset + 4)?;
        let ty = PodType::from_raw(raw_ty).ok_or(TypeError::Pod(PodError::UnknownType(raw_ty)))?;
        let body = offset + HEADER_SIZE;
        if body + size > end {
            return Err(PodError::Truncated.into());
        }
        match ty {
            PodType::Id => patch_u32(data, body, tr)?,
            PodType::Array => {
                let child_size = get_u32(data, body)? as usize;
                let child_ty = get_u32(data, body + 4)?;
                if child_ty == PodType::Id as u32 && child_size == 4 {
                    let mut item = body + 8;
                    while item + 4 <= body + size {
                        patch_u32(data, item, tr)?;
                        item += 4;
                    }
                }
            }
            PodType::Struct => translate_range(data, body, body + size, tr)?,
            PodType::Object => {
                patch_u32(data, body, tr)?;
                translate_range(data, body + 8, body + size, tr)?;
            }
            PodType::Prop => {
                patch_u32(data, body, tr)?;
                let child_size = get_u32(data, body + 8)? as usize;
                let child_ty = get_u32(data, body + 12)?;
                if child_ty == PodType::Id as u32 && child_size == 4 {
                    let stride = round_up8(child_size);
                    let mut item = body + 16;
                    while item + child_size <= body + size {
                        patch_u32(data, item, tr)?;
                        item += stride;
                    }
                }
            }
            _ => {}
        }
        offset = body + round_up8(size);
    }
    Ok(())
}
