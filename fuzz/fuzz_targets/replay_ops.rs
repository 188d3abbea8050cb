#![no_main]

use std::rc::Rc;

use frankenengine_graph_fixup::collaborator::{StateBag, TypeCatalog};
use frankenengine_graph_fixup::config::ManagerConfig;
use frankenengine_graph_fixup::manager::{ObjectManager, PassPhase, RegisterOptions};
use frankenengine_graph_fixup::value::{ObjectHeap, StructValue, Value};
use libfuzzer_sys::fuzz_target;

const MAX_STEPS: usize = 128;
const ID_SPACE: u8 = 12;
const MEMBERS: [&str; 3] = ["a", "b", "c"];

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    run_fixup_program(data);
});

fn run_fixup_program(data: &[u8]) {
    let mut catalog = TypeCatalog::new();
    catalog.set_constructor(
        "Built",
        Rc::new(
            |target: &mut Value, state: &StateBag, heap: &mut ObjectHeap| -> Result<(), String> {
                let Some(handle) = target.as_handle() else {
                    return Ok(());
                };
                for (name, value) in state.iter() {
                    let _ = heap.set_member(handle, name, value.clone());
                }
                Ok(())
            },
        ),
    );
    let Ok(mut manager) = ObjectManager::new(ManagerConfig::deterministic(), catalog) else {
        return;
    };

    let mut cursor = 0usize;
    for _ in 0..MAX_STEPS.min(data.len()) {
        let opcode = byte(data, cursor);
        let x = id(data, cursor + 1);
        let y = id(data, cursor + 2);
        let member = MEMBERS[usize::from(byte(data, cursor + 3)) % MEMBERS.len()];
        cursor = cursor.saturating_add(4);

        let result = match opcode % 8 {
            0 | 1 => {
                let handle = manager.heap_mut().alloc_instance("Node", MEMBERS);
                manager.register_value(x, Value::Ref(handle), RegisterOptions::default())
            }
            2 => {
                let nested = StructValue::new("Pair")
                    .with_field("a", Value::Null)
                    .with_field("b", Value::Int(i64::from(opcode)));
                manager.register_value(
                    x,
                    Value::Struct(nested),
                    RegisterOptions::in_member(y, member),
                )
            }
            3 => {
                let handle = manager.heap_mut().alloc_array("Node", vec![2, 2]);
                manager.register_value(x, Value::Ref(handle), RegisterOptions::default())
            }
            4 => {
                let handle = manager.heap_mut().alloc_instance("Built", MEMBERS);
                let mut state = StateBag::new();
                state.update(member, Value::Null);
                manager.register_value(
                    x,
                    Value::Ref(handle),
                    RegisterOptions::default().with_state(state),
                )
            }
            5 => manager.record_member_fixup(x, member, y),
            6 => {
                let indices = [usize::from(opcode >> 4) % 2, usize::from(opcode >> 6) % 2];
                manager.record_array_fixup_at(x, &indices, y)
            }
            _ => {
                if opcode & 0x10 == 0 {
                    manager.record_delayed_fixup(x, member, y)
                } else {
                    manager.set_root(x)
                }
            }
        };

        if result.is_ok() {
            assert!(
                manager.check_invariants().is_ok(),
                "counting invariant broken after opcode {opcode}"
            );
        }
        if manager.phase() == PassPhase::Closed {
            return;
        }
    }

    let _ = manager.run_completion();
    assert_eq!(manager.phase(), PassPhase::Closed);
    let _ = manager.events().digest();
}

fn id(data: &[u8], index: usize) -> i64 {
    i64::from(byte(data, index) % ID_SPACE) + 1
}

fn byte(data: &[u8], index: usize) -> u8 {
    if data.is_empty() {
        return 0;
    }
    data[index % data.len()]
}
