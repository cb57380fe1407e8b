//! Integration tests for function registration and lookup

use std::sync::Arc;

use bulwark_engine::{Error, FunctionRegistry};

use super::fakes::Spy;

/// Story: A plugin registers "Foo" twice. The second registration is
/// rejected and the first one keeps serving lookups.
#[test]
fn story_duplicate_registration_keeps_the_first() {
    let registry = FunctionRegistry::new();
    let first = Spy::ok("Foo");
    registry.register(first.clone()).expect("first Foo should register");

    let err = registry
        .register(Spy::failing("Foo"))
        .expect_err("second Foo should be rejected");
    assert!(matches!(err, Error::DuplicateName { ref name } if name == "Foo"));
    assert_eq!(registry.len(), 1);

    let found = registry.lookup("Foo").expect("Foo should be registered");
    assert!(std::ptr::eq(
        Arc::as_ptr(&found) as *const (),
        Arc::as_ptr(&first) as *const ()
    ));
    assert!(registry.lookup("Bar").is_none());
}

#[test]
fn builtins_coexist_with_custom_functions() {
    let registry = FunctionRegistry::with_builtins().expect("built-ins should register");
    registry
        .register(Spy::ok("BackupData"))
        .expect("a custom function should register next to the built-ins");

    let names = registry.names();
    let expected = [
        "BackupData",
        "KubeExec",
        "KubeExecAll",
        "KubeTask",
        "PrepareData",
        "ScaleWorkload",
        "Wait",
        "WaitV2",
    ];
    for expected in expected {
        assert!(names.iter().any(|n| n == expected), "{expected} missing from {names:?}");
    }
    let err = registry
        .register(Spy::ok("KubeTask"))
        .expect_err("a custom function may not shadow a built-in");
    assert!(matches!(err, Error::DuplicateName { .. }));
}
