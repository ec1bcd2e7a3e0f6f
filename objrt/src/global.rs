//! Process wide runtime instance for hosts that want a single implicit
//! context instead of threading a [`Runtime`] through their code.

use parking_lot::Mutex;

use crate::{Runtime, RuntimeCreateInfo, RuntimeHooks, SettingsError};

static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

/// Creates the global runtime. Setting it up twice is a host bug.
pub fn setup(info: RuntimeCreateInfo, hooks: RuntimeHooks) -> Result<(), SettingsError> {
    let mut slot = RUNTIME.lock();
    assert!(slot.is_none(), "runtime already set up");
    *slot = Some(Runtime::new(info, hooks)?);
    Ok(())
}

pub fn is_running() -> bool {
    RUNTIME.lock().is_some()
}

/// Runs `f` with exclusive access to the global runtime.
pub fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    let mut slot = RUNTIME.lock();
    match slot.as_mut() {
        Some(runtime) => f(runtime),
        None => panic!("runtime used before setup"),
    }
}

/// Runs the final collection and drops the global runtime. Returns false
/// when there was nothing to tear down.
pub fn teardown() -> bool {
    let runtime = RUNTIME.lock().take();
    match runtime {
        Some(runtime) => {
            runtime.teardown();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TypeDescriptor;

    #[test]
    fn lifecycle() {
        assert!(!teardown());
        setup(
            RuntimeCreateInfo {
                arena_size: 16 * 1024,
                interface_map_slots: Some(64),
                ..Default::default()
            },
            RuntimeHooks::new(),
        )
        .unwrap();
        assert!(is_running());

        let finalized = with_runtime(|rt| {
            let point = rt.register_object(TypeDescriptor::new("Point", 16), &[], None);
            rt.allocate(point);
            rt.allocate(point);
            rt.collect().objects_finalized
        });
        assert_eq!(finalized, 2);

        assert!(teardown());
        assert!(!is_running());
    }
}
