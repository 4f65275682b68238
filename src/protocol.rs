//! The protocol dispatcher (`spec.md` §4.H).
//!
//! Wire envelope: `{u16 length, u16 id}` (host-endian, `spec.md` §6.1)
//! followed by an id-specific payload. `dispatch` is the single seam an
//! untrusted caller's bytes cross before reaching a typed handler;
//! everything below it (maps, programs, links) only ever sees already-
//! validated, already-typed arguments.
//!
//! `LOAD_CODE`'s payload is "machine_code" alone, with no section name,
//! map handles or relocation list alongside it (`spec.md` §4.H operation
//! table). Read together with `RESOLVE_HELPER`/`RESOLVE_MAP` returning
//! addresses by themselves, the wire protocol models a caller-side
//! loader (explicitly out of scope, `spec.md` §1) that queries each
//! relocation's address individually, bakes it into the machine code it
//! assembles, and only then calls `LOAD_CODE` with nothing left to
//! relocate — so the dispatcher's `LOAD_CODE` handler always calls
//! [`crate::program::ProgramObject::create`] in `Jit` mode with an empty
//! relocation list; a caller wanting `INTERPRET` mode or relocations
//! resolved by the core itself calls `ProgramObject::create` directly
//! (this crate is the runtime's library surface, not only its wire
//! protocol).
//!
//! `RESOLVE_MAP` cannot literally return "the map's storage address":
//! `crate::map::MapObject` never exposes one (a hash map's entries have
//! no fixed address, and handing out an array map's would make the
//! epoch-guarded `lookup` API pointless). It instead returns the map
//! object's `Arc` address as a stable-for-the-object's-lifetime `u64`
//! capability token — a real, if non-dereferenceable-by-the-caller,
//! answer to "an integer that identifies this map's backing storage."

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::handle::INVALID_HANDLE_VALUE;
use crate::map::{MapDef, MapKind, MapObject};
use crate::object::{downcast, downcast_arc, ObjectKind};
use crate::program::{attach, detach, ExecutionMode, ProgramObject};
use crate::runtime::Runtime;

pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpId {
    Evidence = 0,
    ResolveHelper = 1,
    ResolveMap = 2,
    LoadCode = 3,
    UnloadCode = 4,
    AttachCode = 5,
    DetachCode = 6,
    CreateMap = 7,
    MapLookupElement = 8,
    MapUpdateElement = 9,
    MapDeleteElement = 10,
}

impl OpId {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => OpId::Evidence,
            1 => OpId::ResolveHelper,
            2 => OpId::ResolveMap,
            3 => OpId::LoadCode,
            4 => OpId::UnloadCode,
            5 => OpId::AttachCode,
            6 => OpId::DetachCode,
            7 => OpId::CreateMap,
            8 => OpId::MapLookupElement,
            9 => OpId::MapUpdateElement,
            10 => OpId::MapDeleteElement,
            _ => return None,
        })
    }

    /// `(min_request_size, min_reply_size)`, both including the header
    /// (`spec.md` §4.H). Variable-tail payloads (machine code, keys,
    /// values) contribute nothing to the minimum beyond their fixed
    /// prefix; per-map key/value length mismatches are caught inside the
    /// handler, which already validates against that map's own
    /// definition.
    fn sizes(self) -> (usize, usize) {
        match self {
            OpId::Evidence => (HEADER_LEN, HEADER_LEN + 4),
            OpId::ResolveHelper => (HEADER_LEN + 4, HEADER_LEN + 8),
            OpId::ResolveMap => (HEADER_LEN + 8, HEADER_LEN + 8),
            OpId::LoadCode => (HEADER_LEN, HEADER_LEN + 8),
            OpId::UnloadCode => (HEADER_LEN + 8, HEADER_LEN),
            OpId::AttachCode => (HEADER_LEN + 8 + 4, HEADER_LEN),
            OpId::DetachCode => (HEADER_LEN + 8 + 4, HEADER_LEN),
            OpId::CreateMap => (HEADER_LEN + 16, HEADER_LEN + 8),
            OpId::MapLookupElement => (HEADER_LEN + 8, HEADER_LEN),
            OpId::MapUpdateElement => (HEADER_LEN + 8, HEADER_LEN),
            OpId::MapDeleteElement => (HEADER_LEN + 8, HEADER_LEN),
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn handle_op(runtime: &Runtime, op: OpId, payload: &[u8]) -> Result<Vec<u8>> {
    match op {
        OpId::Evidence => Ok(0u32.to_ne_bytes().to_vec()),

        OpId::ResolveHelper => {
            if payload.len() < 4 {
                return Err(Error::InvalidParameter);
            }
            let helper_id = read_u32(payload, 0);
            let address = runtime.collaborators.resolve_helper(helper_id).ok_or(Error::NotFound)?;
            Ok(address.to_ne_bytes().to_vec())
        }

        OpId::ResolveMap => {
            if payload.len() < 8 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Map))?;
            let map = downcast::<MapObject>(&obj).ok_or(Error::InvalidObjectType)?;
            let token = map as *const MapObject as u64;
            Ok(token.to_ne_bytes().to_vec())
        }

        OpId::LoadCode => {
            let program = ProgramObject::create(
                ExecutionMode::Jit,
                String::new(),
                String::new(),
                &[],
                payload.to_vec(),
                &[],
                &runtime.handles,
                Arc::clone(&runtime.domain),
                Arc::clone(&runtime.collaborators),
            )?;
            let handle = runtime.handles.allocate_handle(Arc::new(program));
            Ok(handle.to_ne_bytes().to_vec())
        }

        OpId::UnloadCode => {
            if payload.len() < 8 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Program))?;
            let program = downcast::<ProgramObject>(&obj).ok_or(Error::InvalidObjectType)?;
            program.unload()?;
            runtime.handles.close_handle(handle)?;
            Ok(Vec::new())
        }

        OpId::AttachCode => {
            if payload.len() < 12 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let hook_id = read_u32(payload, 8);
            let hook = runtime.hook(hook_id).ok_or(Error::NotFound)?;
            let obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Program))?;
            // `attach` needs to own an `Arc<ProgramObject>` (it captures
            // it into the fan-out invoker closure), so recover one
            // through the safe `Arc<dyn Any>` downcast rather than a
            // borrowed reference.
            let program_arc = downcast_arc::<ProgramObject>(&obj).ok_or(Error::InvalidObjectType)?;
            let link = attach(program_arc, &runtime.registry, hook)?;
            runtime.handles.allocate_handle(Arc::new(link));
            Ok(Vec::new())
        }

        OpId::DetachCode => {
            if payload.len() < 12 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let hook_id = read_u32(payload, 8);
            let hook = runtime.hook(hook_id).ok_or(Error::NotFound)?;
            let program_obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Program))?;
            let program_arc = downcast_arc::<ProgramObject>(&program_obj).ok_or(Error::InvalidObjectType)?;
            let mut cur = INVALID_HANDLE_VALUE;
            loop {
                cur = runtime.handles.next(cur, Some(ObjectKind::Link));
                if cur == INVALID_HANDLE_VALUE {
                    return Err(Error::NotFound);
                }
                let obj = runtime.handles.resolve_handle(cur, Some(ObjectKind::Link))?;
                let link_obj = downcast::<crate::link::LinkObject>(&obj).ok_or(Error::InvalidObjectType)?;
                if link_obj.hook_attach_type() != hook.interface_id() || !Arc::ptr_eq(link_obj.program(), &program_arc) {
                    continue;
                }
                detach(&runtime.registry, link_obj)?;
                drop(obj);
                runtime.handles.close_handle(cur)?;
                break;
            }
            Ok(Vec::new())
        }

        OpId::CreateMap => {
            if payload.len() < 16 {
                return Err(Error::InvalidParameter);
            }
            let kind = match read_u32(payload, 0) {
                0 => MapKind::Array,
                1 => MapKind::Hash,
                _ => return Err(Error::InvalidParameter),
            };
            let def = MapDef {
                kind,
                key_size: read_u32(payload, 4) as usize,
                value_size: read_u32(payload, 8) as usize,
                max_entries: read_u32(payload, 12) as usize,
            };
            let map = MapObject::create(def, Arc::clone(&runtime.domain))?;
            let handle = runtime.handles.allocate_handle(Arc::new(map));
            Ok(handle.to_ne_bytes().to_vec())
        }

        OpId::MapLookupElement => {
            if payload.len() < 8 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let key = &payload[8..];
            let obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Map))?;
            let map = downcast::<MapObject>(&obj).ok_or(Error::InvalidObjectType)?;
            map.lookup_copy(key)
        }

        OpId::MapUpdateElement => {
            if payload.len() < 8 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Map))?;
            let map = downcast::<MapObject>(&obj).ok_or(Error::InvalidObjectType)?;
            let def = map.def();
            if payload.len() < 8 + def.key_size + def.value_size {
                return Err(Error::InvalidParameter);
            }
            let key = &payload[8..8 + def.key_size];
            let value = &payload[8 + def.key_size..8 + def.key_size + def.value_size];
            map.update(key, value)?;
            Ok(Vec::new())
        }

        OpId::MapDeleteElement => {
            if payload.len() < 8 {
                return Err(Error::InvalidParameter);
            }
            let handle = read_u64(payload, 0);
            let key = &payload[8..];
            let obj = runtime.handles.resolve_handle(handle, Some(ObjectKind::Map))?;
            let map = downcast::<MapObject>(&obj).ok_or(Error::InvalidObjectType)?;
            map.delete(key)?;
            Ok(Vec::new())
        }
    }
}

/// Parses `request`'s header, validates `spec.md` §4.H's boundary rules,
/// dispatches to the matching handler, and writes a full `{length, id,
/// payload}` reply into `reply` (cleared first). Returns the error code
/// a caller observes; `reply` is only meaningfully populated on
/// [`ErrorCode::Success`].
pub fn dispatch(runtime: &Runtime, request: &[u8], reply: &mut Vec<u8>) -> ErrorCode {
    if request.len() < HEADER_LEN {
        return ErrorCode::InvalidParameter;
    }
    let declared_length = u16::from_ne_bytes([request[0], request[1]]) as usize;
    let id_raw = u16::from_ne_bytes([request[2], request[3]]);

    let Some(op) = OpId::from_u16(id_raw) else {
        return ErrorCode::NotFound;
    };

    let (min_request_size, _min_reply_size) = op.sizes();
    // `spec.md` §4.H step 1: the length check is against the *declared*
    // header field, independent of how many bytes the caller actually
    // supplied — scenario S6 relies on this (`length` lies short).
    if declared_length < min_request_size {
        return ErrorCode::InvalidParameter;
    }
    if declared_length > request.len() {
        return ErrorCode::InvalidParameter;
    }

    let payload = &request[HEADER_LEN..declared_length];
    match handle_op(runtime, op, payload) {
        Ok(reply_payload) => {
            reply.clear();
            let total_len = (HEADER_LEN + reply_payload.len()) as u16;
            reply.extend_from_slice(&total_len.to_ne_bytes());
            reply.extend_from_slice(&id_raw.to_ne_bytes());
            reply.extend_from_slice(&reply_payload);
            ErrorCode::Success
        }
        Err(e) => {
            log::debug!("dispatch of op {op:?} failed: {e}");
            ErrorCode::from(e)
        }
    }
}
