mod common;

use std::sync::{Arc, Mutex};

use common::*;
use loadwatch::config::HooksConfig;
use loadwatch::decoder::NtStatus;
use loadwatch::detour::HookState;
use loadwatch::last_error::{ThreadErrorState, ThreadLocalErrorState};
use loadwatch::{ModuleInterface, module_hooks::HookStatus};
use shared::constants::{NT_MAP_VIEW_OF_SECTION, NT_UNMAP_VIEW_OF_SECTION};
use shared::errors::HookError;
use shared::events::{ModuleHandle, ModuleMapped, ModuleUnmapped};

const OVERLAY_PATH: &str = r"C:\Program Files\Vendor\Overlay.dll";
const STATUS_CONFLICTING_ADDRESSES: NtStatus = NtStatus(0xC000_0018_u32 as i32);
const STATUS_IMAGE_NOT_AT_BASE: NtStatus = NtStatus(0x4000_0003);

fn installed() -> (TestHooks, FakeProcess) {
    let (hooks, process) = hooks();
    hooks.install(&HooksConfig::default(), &REPLACEMENTS).unwrap();
    (hooks, process)
}

fn record_maps(hooks: &TestHooks) -> Arc<Mutex<Vec<ModuleMapped>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    hooks.register_on_map(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

fn record_unmaps(hooks: &TestHooks) -> Arc<Mutex<Vec<ModuleUnmapped>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    hooks.register_on_unmap(move |event| sink.lock().unwrap().push(*event));
    seen
}

#[test]
fn image_load_and_unload_notify_exactly_once() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let maps = record_maps(&hooks);
    let unmaps = record_unmaps(&hooks);

    let status = hooks.map_view_of_section(
        CURRENT_PROCESS,
        |entry| {
            assert_eq!(entry, MAP_TARGET + TRAMPOLINE_OFFSET);
            STATUS_IMAGE_NOT_AT_BASE
        },
        || Some(IMAGE_BASE),
    );
    assert_eq!(status, STATUS_IMAGE_NOT_AT_BASE);

    let mapped = maps.lock().unwrap().clone();
    assert_eq!(
        mapped,
        vec![ModuleMapped {
            module: ModuleHandle(IMAGE_BASE),
            path: OVERLAY_PATH.to_owned(),
            name: "OVERLAY.DLL".to_owned(),
        }]
    );

    let status = hooks.unmap_view_of_section(CURRENT_PROCESS, IMAGE_BASE, |entry| {
        assert_eq!(entry, UNMAP_TARGET + TRAMPOLINE_OFFSET);
        NtStatus::SUCCESS
    });
    assert_eq!(status, NtStatus::SUCCESS);
    assert_eq!(*unmaps.lock().unwrap(), vec![ModuleUnmapped::from(&mapped[0])]);
}

#[test]
fn results_and_error_state_match_a_direct_call() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let errors = ThreadLocalErrorState;
    // a subscriber that clobbers the thread error value
    hooks.register_on_map(move |_| ThreadLocalErrorState.set_last_error(0xdead));
    hooks.register_on_unmap(move |_| ThreadLocalErrorState.set_last_error(0xbeef));

    let original = |status: NtStatus, error: u32| {
        move |_entry: usize| {
            ThreadLocalErrorState.set_last_error(error);
            status
        }
    };

    for (status, error) in [
        (NtStatus::SUCCESS, 0),
        (STATUS_IMAGE_NOT_AT_BASE, 0),
        (STATUS_CONFLICTING_ADDRESSES, 487),
    ] {
        errors.set_last_error(1);
        let direct = original(status, error)(MAP_TARGET);
        let direct_error = errors.last_error();

        errors.set_last_error(1);
        let via = hooks.map_view_of_section(CURRENT_PROCESS, original(status, error), || {
            Some(IMAGE_BASE)
        });
        assert_eq!(via, direct);
        assert_eq!(errors.last_error(), direct_error);

        errors.set_last_error(1);
        let via = hooks.unmap_view_of_section(CURRENT_PROCESS, IMAGE_BASE, original(status, error));
        assert_eq!(via, direct);
        assert_eq!(errors.last_error(), direct_error);
    }
}

#[test]
fn failed_calls_are_not_reported() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let maps = record_maps(&hooks);
    let unmaps = record_unmaps(&hooks);

    let mut base_read = false;
    let status = hooks.map_view_of_section(
        CURRENT_PROCESS,
        |_| STATUS_CONFLICTING_ADDRESSES,
        || {
            base_read = true;
            Some(IMAGE_BASE)
        },
    );
    assert_eq!(status, STATUS_CONFLICTING_ADDRESSES);
    assert!(!base_read, "out-parameter must not be read after a failure");

    unmap_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, STATUS_CONFLICTING_ADDRESSES);

    assert!(maps.lock().unwrap().is_empty());
    assert!(unmaps.lock().unwrap().is_empty());
}

#[test]
fn other_processes_are_ignored() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let maps = record_maps(&hooks);
    let unmaps = record_unmaps(&hooks);

    map_through(&hooks, OTHER_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    unmap_through(&hooks, OTHER_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);

    assert!(maps.lock().unwrap().is_empty());
    assert!(unmaps.lock().unwrap().is_empty());
    // filtered before the address space is inspected
    assert_eq!(process.region_queries(), 0);
}

#[test]
fn only_image_views_with_a_loader_path_are_reported() {
    let (hooks, process) = installed();
    let maps = record_maps(&hooks);

    // data file mapping
    process.set_loader_path(Some(OVERLAY_PATH));
    map_through(&hooks, CURRENT_PROCESS, DATA_BASE, NtStatus::SUCCESS);
    // image mapped outside the loader
    process.set_loader_path(None);
    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    // view that cannot be queried
    process.set_loader_path(Some(OVERLAY_PATH));
    let status = map_through(&hooks, CURRENT_PROCESS, 0x4444_0000, NtStatus::SUCCESS);

    assert_eq!(status, NtStatus::SUCCESS);
    assert!(maps.lock().unwrap().is_empty());
}

#[test]
fn unmaps_are_reported_for_any_view_of_the_current_process() {
    let (hooks, _process) = installed();
    let unmaps = record_unmaps(&hooks);

    unmap_through(&hooks, CURRENT_PROCESS, DATA_BASE, NtStatus::SUCCESS);

    assert_eq!(
        *unmaps.lock().unwrap(),
        vec![ModuleUnmapped {
            module: ModuleHandle(DATA_BASE)
        }]
    );
}

#[test]
fn subscribers_run_in_registration_order() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for tag in ['A', 'B', 'C'] {
        let order = Arc::clone(&order);
        ids.push(hooks.register_on_map(move |_| order.lock().unwrap().push(tag)));
    }

    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    assert_eq!(*order.lock().unwrap(), ['A', 'B', 'C']);

    order.lock().unwrap().clear();
    hooks.unregister_on_map(ids[1]);
    hooks.unregister_on_map(ids[1]);
    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    assert_eq!(*order.lock().unwrap(), ['A', 'C']);
}

#[test]
fn failing_subscriber_does_not_affect_the_caller_or_the_others() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    hooks.register_on_map(|event| panic!("cannot handle {}", event.name));
    let maps = record_maps(&hooks);

    let status = map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, STATUS_IMAGE_NOT_AT_BASE);

    assert_eq!(status, STATUS_IMAGE_NOT_AT_BASE);
    assert_eq!(maps.lock().unwrap().len(), 1);
    assert!(hooks.status().iter().all(|s| s.in_flight == 0));
}

#[test]
fn nested_map_from_a_subscriber_is_forwarded_silently() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let hooks = Arc::new(hooks);
    let maps = record_maps(&hooks);
    let forwarded = Arc::new(Mutex::new(0));

    {
        let inner = Arc::clone(&hooks);
        let forwarded = Arc::clone(&forwarded);
        hooks.register_on_map(move |_| {
            // a subscriber that loads a helper library while being notified
            let status = inner.map_view_of_section(
                CURRENT_PROCESS,
                |_| {
                    *forwarded.lock().unwrap() += 1;
                    NtStatus::SUCCESS
                },
                || Some(IMAGE_BASE),
            );
            assert_eq!(status, NtStatus::SUCCESS);
        });
    }

    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);

    assert_eq!(*forwarded.lock().unwrap(), 1);
    assert_eq!(maps.lock().unwrap().len(), 1);
    assert_eq!(hooks.status()[0].in_flight, 0);

    // the flag was released: a fresh top-level call is reported again
    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    assert_eq!(maps.lock().unwrap().len(), 2);

    // break the Arc cycle held by the subscriber
    hooks.teardown().unwrap();
}

#[test]
fn unmap_from_a_map_subscriber_is_still_reported() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let hooks = Arc::new(hooks);
    let unmaps = record_unmaps(&hooks);

    {
        let inner = Arc::clone(&hooks);
        hooks.register_on_map(move |event| {
            unmap_through(&inner, CURRENT_PROCESS, event.module.base(), NtStatus::SUCCESS);
        });
    }

    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);

    assert_eq!(unmaps.lock().unwrap().len(), 1);
    hooks.teardown().unwrap();
}

#[test]
fn install_is_all_or_nothing() {
    let (hooks, _process) = hooks_with(FakeResolver::ntdll().without(NT_UNMAP_VIEW_OF_SECTION));

    let err = hooks.install(&HooksConfig::default(), &REPLACEMENTS).unwrap_err();

    assert!(matches!(
        err,
        HookError::Resolution { ref symbol, .. } if symbol == NT_UNMAP_VIEW_OF_SECTION
    ));
    assert!(hooks.status().iter().all(|s| s.state == HookState::Uninstalled));
    let patcher = hooks.controller().patcher();
    assert!(!patcher.is_patched(MAP_TARGET));
    assert_eq!(patcher.live_trampolines(), 0);
}

#[test]
fn disabled_interception_is_left_alone() {
    let (hooks, _process) = hooks();
    let only_map = HooksConfig {
        map_view: true,
        unmap_view: false,
    };
    hooks.install(&only_map, &REPLACEMENTS).unwrap();

    assert_eq!(
        hooks.status(),
        [
            HookStatus {
                name: NT_MAP_VIEW_OF_SECTION,
                state: HookState::Installed,
                target: Some(MAP_TARGET),
                in_flight: 0,
            },
            HookStatus {
                name: NT_UNMAP_VIEW_OF_SECTION,
                state: HookState::Uninstalled,
                target: None,
                in_flight: 0,
            },
        ]
    );
    assert!(!hooks.controller().patcher().is_patched(UNMAP_TARGET));
    hooks.teardown().unwrap();
}

#[test]
fn second_install_is_rejected() {
    let (hooks, _process) = installed();
    assert!(matches!(
        hooks.install(&HooksConfig::default(), &REPLACEMENTS),
        Err(HookError::InvalidState { operation: "install", .. })
    ));
    // the first installation is untouched
    assert!(hooks.status().iter().all(|s| s.state == HookState::Installed));
}

#[test]
fn teardown_unpatches_and_silences_everything() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let maps = record_maps(&hooks);
    let unmaps = record_unmaps(&hooks);

    hooks.teardown().unwrap();

    let patcher = hooks.controller().patcher();
    assert!(!patcher.is_patched(MAP_TARGET));
    assert!(!patcher.is_patched(UNMAP_TARGET));
    assert_eq!(patcher.live_trampolines(), 0);
    assert!(hooks.status().iter().all(|s| s.state == HookState::Uninstalled));

    // a late caller still reaches the original, now at its own address
    let status = hooks.map_view_of_section(
        CURRENT_PROCESS,
        |entry| {
            assert_eq!(entry, MAP_TARGET);
            NtStatus::SUCCESS
        },
        || Some(IMAGE_BASE),
    );
    assert_eq!(status, NtStatus::SUCCESS);
    unmap_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    assert!(maps.lock().unwrap().is_empty());
    assert!(unmaps.lock().unwrap().is_empty());

    // nothing left to remove
    hooks.teardown().unwrap();
}

#[test]
fn registration_through_the_interface() {
    let (hooks, process) = installed();
    process.set_loader_path(Some(OVERLAY_PATH));
    let names = Arc::new(Mutex::new(Vec::new()));

    let iface: &dyn ModuleInterface = &hooks;
    let map_id = {
        let names = Arc::clone(&names);
        iface.register_on_map(Box::new(move |event: &ModuleMapped| {
            names.lock().unwrap().push(event.name.clone())
        }))
    };
    let unmap_id = iface.register_on_unmap(Box::new(|_: &ModuleUnmapped| {}));

    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);
    iface.unregister_on_map(map_id);
    iface.unregister_on_unmap(unmap_id);
    iface.unregister_on_unmap(unmap_id);
    map_through(&hooks, CURRENT_PROCESS, IMAGE_BASE, NtStatus::SUCCESS);

    assert_eq!(*names.lock().unwrap(), ["OVERLAY.DLL"]);
}
