//! Test utilities for pkgsys_loader.

use std::collections::BTreeMap;

use pkgsys_manifest::{Artifact, UnitManifest};

/// Helper to compile WAT to WASM bytes
pub fn wat_to_wasm(wat_source: &str) -> Vec<u8> {
    wat::parse_str(wat_source).expect("Invalid WAT")
}

/// A small unit: two constants, two functions, an initializer that flips a
/// flag, and a function that never returns.
pub const TOOLS_WAT: &str = r#"
(module
    (memory (export "memory") 1)
    (global (export "answer") i32 (i32.const 42))
    (global (export "big") i64 (i64.const 9000000000))
    (global $ready (mut i32) (i32.const 0))

    (func (export "_initialize")
        (global.set $ready (i32.const 1))
    )
    (func (export "add") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.add
    )
    (func (export "initialized") (result i32)
        global.get $ready
    )
    (func (export "spin")
        (loop $forever (br $forever))
    )
)
"#;

/// The exports [`TOOLS_WAT`] declares in its manifest.
pub const TOOLS_EXPORTS: &[&str] = &["add", "answer", "big", "initialized"];

/// An unsigned artifact from provider `acme` with `{unit}.wasm` as entry point.
pub fn unit_artifact(unit: &str, exports: &[&str], wasm: Vec<u8>) -> Artifact {
    let entry_point = format!("{unit}.wasm");
    let manifest = UnitManifest {
        name: unit.to_string(),
        provider: "acme".to_string(),
        version: "1.0.0".to_string(),
        entry_point: entry_point.clone(),
        exports: exports.iter().map(|s| s.to_string()).collect(),
    };
    Artifact::seal(manifest, BTreeMap::from([(entry_point, wasm)]))
}
