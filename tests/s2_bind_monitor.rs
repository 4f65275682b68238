//! `spec.md` §8 scenario S2 (bind-monitor): a BIND-like hook program that
//! tracks per-pid bind counts against a shared limit, enforced through
//! two maps (`counts`, keyed by pid; `limits`, a single-entry array).
//!
//! As in `s1_drop_packet.rs`, the program body is a [`CodeBackend`] test
//! double standing in for a verified, compiled program. The context
//! encodes `{pid: u32, op: u8}`, `op` 0 = BIND, 1 = UNBIND.

use std::sync::{Arc, Mutex};

use sandrt::collaborators::{AlwaysAcceptVerifier, CodeBackend, Collaborators, DefaultCollaborators, StaticHelperTable};
use sandrt::epoch::EpochDomain;
use sandrt::error::Result;
use sandrt::extension::ExtensionRegistry;
use sandrt::handle::HandleTable;
use sandrt::hook::{Hook, HookKind};
use sandrt::map::{MapDef, MapKind, MapObject};
use sandrt::object::Object;
use sandrt::platform::Guid;
use sandrt::program::{attach, detach, ExecutionMode, ProgramObject, Relocation};

const PERMIT: u32 = 0;
const DENY: u32 = 1;

struct BindMonitorBackend {
    counts: Mutex<Option<Arc<MapObject>>>,
    limits: Mutex<Option<Arc<MapObject>>>,
}

impl BindMonitorBackend {
    fn new() -> Self {
        BindMonitorBackend { counts: Mutex::new(None), limits: Mutex::new(None) }
    }

    fn bind_maps(&self, counts: Arc<MapObject>, limits: Arc<MapObject>) {
        *self.counts.lock().unwrap() = Some(counts);
        *self.limits.lock().unwrap() = Some(limits);
    }
}

fn read_count(map: &MapObject, pid: u32) -> u32 {
    match map.lookup_copy(&pid.to_ne_bytes()) {
        Ok(bytes) => u32::from_ne_bytes(bytes.try_into().unwrap()),
        Err(_) => 0,
    }
}

impl CodeBackend for BindMonitorBackend {
    fn jit_compile(&self, bytecode: &[u8]) -> Result<Vec<u8>> {
        Ok(bytecode.to_vec())
    }

    fn interpret(&self, _bytecode: &[u8], ctx_ptr: u64) -> u32 {
        // SAFETY: `ProgramObject::invoke` passes `context.as_ptr() as u64`
        // straight through to `interpret` for the duration of this call;
        // every caller here passes a live 5-byte `{pid, op}` buffer.
        let ctx = unsafe { std::slice::from_raw_parts(ctx_ptr as *const u8, 5) };
        let pid = u32::from_ne_bytes(ctx[0..4].try_into().unwrap());
        let op = ctx[4];

        let counts_guard = self.counts.lock().unwrap();
        let counts = counts_guard.as_ref().expect("maps bound before first fire");
        let limits_guard = self.limits.lock().unwrap();
        let limits = limits_guard.as_ref().expect("maps bound before first fire");

        let limit = read_count(limits, 0);
        let current = read_count(counts, pid);

        match op {
            0 => {
                if current < limit {
                    counts.update(&pid.to_ne_bytes(), &(current + 1).to_ne_bytes()).unwrap();
                    PERMIT
                } else {
                    DENY
                }
            }
            _ => {
                if current > 0 {
                    counts.update(&pid.to_ne_bytes(), &(current - 1).to_ne_bytes()).unwrap();
                }
                PERMIT
            }
        }
    }
}

fn ctx(pid: u32, op: u8) -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0..4].copy_from_slice(&pid.to_ne_bytes());
    buf[4] = op;
    buf
}

#[test]
fn bind_monitor_permits_up_to_the_limit_then_denies() {
    let domain = Arc::new(EpochDomain::new());
    let handle_table = HandleTable::new();
    let registry = ExtensionRegistry::new();
    let hook = Hook::new(&registry, Guid::new_v4(), HookKind::Bind).unwrap();

    let counts = Arc::new(MapObject::create(
        MapDef { kind: MapKind::Hash, key_size: 4, value_size: 4, max_entries: 16 },
        Arc::clone(&domain),
    ).unwrap());
    let limits = Arc::new(MapObject::create(
        MapDef { kind: MapKind::Array, key_size: 4, value_size: 4, max_entries: 1 },
        Arc::clone(&domain),
    ).unwrap());
    limits.update(&0u32.to_ne_bytes(), &2u32.to_ne_bytes()).unwrap();

    let counts_handle = handle_table.allocate_handle({ let o: Object = Arc::clone(&counts); o });
    let limits_handle = handle_table.allocate_handle({ let o: Object = Arc::clone(&limits); o });

    let backend = Arc::new(BindMonitorBackend::new());
    backend.bind_maps(Arc::clone(&counts), Arc::clone(&limits));
    let collaborators: Arc<dyn Collaborators> = Arc::new(DefaultCollaborators {
        verifier: Arc::new(AlwaysAcceptVerifier),
        backend: backend.clone(),
        helpers: Arc::new(StaticHelperTable::new()),
    });

    let program = Arc::new(
        ProgramObject::create(
            ExecutionMode::Interpret,
            "bind".into(),
            "monitor.o".into(),
            &[counts_handle, limits_handle],
            vec![0xbe, 0xef],
            &[Relocation::Map { map_index: 0 }, Relocation::Map { map_index: 1 }],
            &handle_table,
            Arc::clone(&domain),
            collaborators,
        )
        .unwrap(),
    );

    let link = attach(Arc::clone(&program), &registry, &hook).unwrap();

    let pid = 12345u32;
    assert_eq!(hook.fire(&ctx(pid, 0)), PERMIT);
    assert_eq!(read_count(&counts, pid), 1);
    assert_eq!(hook.fire(&ctx(pid, 0)), PERMIT);
    assert_eq!(read_count(&counts, pid), 2);
    assert_eq!(hook.fire(&ctx(pid, 0)), DENY);
    assert_eq!(read_count(&counts, pid), 2);

    assert_eq!(hook.fire(&ctx(pid, 1)), PERMIT);
    assert_eq!(read_count(&counts, pid), 1);
    assert_eq!(hook.fire(&ctx(pid, 1)), PERMIT);
    assert_eq!(read_count(&counts, pid), 0);

    detach(&registry, &link).unwrap();
    program.unload().unwrap();
}
