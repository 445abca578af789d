mod common;

use optrie::{compile, Catalog, CompileError, CompileOptions, DecodeKey, RepState};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::select;

/// Opcode specs chosen so that random subsets overlap often.
const SPECS: &[&str] = &[
    "01",
    "01 /r",
    "01 /0",
    "01 /1 /mod_3",
    "01 /1 /mod_m",
    "01 /1 /rm_2",
    "01 /1 /mod_3 /rm_2",
    "50",
    "53",
    "63 /r",
    "0f 10 /r",
    "f3 0f 10 /r",
    "no66 nofx 0f 10 /r",
    "66 0f 10 /r",
    "0f 38 &00 /r",
    "0f 38 &01",
    "0f 0f &9e /r",
    "0f 0f &9a /2",
    "d9 /0 /mod_m",
    "d9 /0 /mod_3",
    "d9 /2 /mod_3 /rm_0",
    "d9 /2",
    "fe",
];

const TAGS: &[&[&str]] = &[
    &[],
    &[],
    &[],
    &["etag_reg_base"],
    &["etag_like_arpl"],
    &["etag_like_movsxd"],
    &["etag_like_arpl", "etag_like_movsxd"],
];

const REPS: &[RepState] = &[RepState::None, RepState::F2, RepState::F3];

const HOT_BYTES: &[u8] = &[0x00, 0x01, 0x0f, 0x10, 0x38, 0x50, 0x53, 0x63, 0x9e, 0xd9];

fn catalog_picks() -> impl Strategy<Value = Vec<(usize, usize)>> {
    vec((0..SPECS.len(), 0..TAGS.len()), 1..8)
}

fn probe_key() -> impl Strategy<Value = DecodeKey> {
    let byte = || prop_oneof![select(HOT_BYTES), any::<u8>()];
    (
        vec(byte(), 1..=3),
        any::<bool>(),
        select(REPS),
        proptest::option::of(any::<u8>()),
        any::<bool>(),
        proptest::option::of(byte()),
    )
        .prop_map(|(opcode, op_size, rep, modrm, rex_w, suffix)| DecodeKey {
            op_size,
            rep,
            opcode,
            modrm,
            rex_w,
            suffix,
        })
}

fn build(picks: &[(usize, usize)]) -> Catalog {
    let names: Vec<String> = (0..picks.len()).map(|i| format!("i{i}")).collect();
    let entries: Vec<(&str, &str, &[&str])> = picks
        .iter()
        .zip(&names)
        .map(|(&(spec, tags), name)| (name.as_str(), SPECS[spec], TAGS[tags]))
        .collect();
    common::catalog(&entries).expect("pool entries are valid catalog records")
}

fn is_data_error(err: &CompileError) -> bool {
    matches!(
        err,
        CompileError::DuplicateOpcode { .. }
            | CompileError::OpcodeConflict { .. }
            | CompileError::RegisterBaseOverflow { .. }
    )
}

fn without_collapse() -> CompileOptions {
    CompileOptions {
        collapse_modrm: false,
        ..CompileOptions::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn every_key_resolves_to_its_encoding(picks in catalog_picks()) {
        common::init_tracing();
        let catalog = build(&picks);
        let options = CompileOptions::default();
        match compile(&catalog, &options) {
            Ok(artifacts) => {
                for (number, key) in common::all_keys(&catalog, &options) {
                    prop_assert_eq!(artifacts.table.lookup(&key), Some(number), "key {:?}", key);
                }
            }
            Err(err) => prop_assert!(is_data_error(&err), "unexpected error: {}", err),
        }
    }

    #[test]
    fn collapse_does_not_change_lookups(
        picks in catalog_picks(),
        probes in vec(probe_key(), 64),
    ) {
        let catalog = build(&picks);
        let options = CompileOptions::default();
        let collapsed = compile(&catalog, &options);
        let plain = compile(&catalog, &without_collapse());

        match (collapsed, plain) {
            (Ok(collapsed), Ok(plain)) => {
                prop_assert!(collapsed.table.body().len() <= plain.table.body().len());
                let keys = common::all_keys(&catalog, &options)
                    .into_iter()
                    .map(|(_, key)| key)
                    .chain(probes);
                for key in keys {
                    prop_assert_eq!(
                        collapsed.table.lookup(&key),
                        plain.table.lookup(&key),
                        "key {:?}",
                        key
                    );
                }
            }
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            (a, b) => prop_assert!(false, "collapse changed the outcome: {:?} vs {:?}", a.err(), b.err()),
        }
    }

    #[test]
    fn compile_is_deterministic(picks in catalog_picks()) {
        let first = compile(&build(&picks), &CompileOptions::default());
        let second = compile(&build(&picks), &CompileOptions::default());
        match (first, second) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            _ => prop_assert!(false, "outcome differs between runs"),
        }
    }

    #[test]
    fn lookups_never_panic(picks in catalog_picks(), probes in vec(probe_key(), 64)) {
        if let Ok(artifacts) = compile(&build(&picks), &CompileOptions::default()) {
            let encodings = picks.len() as u32;
            for key in &probes {
                if let Some(number) = artifacts.table.lookup(key) {
                    prop_assert!(number < encodings);
                }
            }
        }
    }
}
