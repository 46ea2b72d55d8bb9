//! Command surface
//!
//! Dispatches parsed `HOPPER.*` command vectors against a cache instance
//! and produces protocol-agnostic [`Reply`] values; the host server encodes
//! them onto the wire. Reply shapes and error texts follow the command
//! contract: STATS is a 24-element label/value array, RESRC.GET a 4-element
//! array, CONFIG.GET a 12-element label/value array.

use bytes::Bytes;

use crate::config::{GhostRange, ALLOC_TOTAL_NET_BW, GHOST_SAMPLE_SHIFT};
use crate::error::{CheckpointError, Error, StorageError};
use crate::ghost::round_tick;
use crate::instance::CacheInstance;
use crate::stats::MrcReport;

/// Protocol-agnostic reply value
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Bulk(Bytes),
    Int(i64),
    Double(f64),
    Array(Vec<Reply>),
    Null,
    Error(String),
}

impl Reply {
    fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    fn err(msg: impl Into<String>) -> Reply {
        Reply::Error(format!("ERR {}", msg.into()))
    }

    fn wrong_arity(cmd: &str) -> Reply {
        Reply::err(format!("wrong number of arguments for '{cmd}' command"))
    }

    fn label(s: &str) -> Reply {
        Reply::Simple(s.to_string())
    }

    fn bool(b: bool) -> Reply {
        Reply::Int(b as i64)
    }
}

/// Dispatch one command vector. `argv[0]` is the command name,
/// case-insensitive.
pub fn dispatch(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    let Some(cmd) = argv.first() else {
        return Reply::err("empty command");
    };
    let cmd = String::from_utf8_lossy(cmd).to_ascii_uppercase();

    match cmd.as_str() {
        "HOPPER.GET" => cmd_get(inst, argv),
        "HOPPER.SET" => cmd_set(inst, argv),
        "HOPPER.SETC" => cmd_setc(inst, argv),
        "HOPPER.LOAD" => cmd_load(inst, argv),
        "HOPPER.STATS" => cmd_stats(inst, argv),
        "HOPPER.RESRC.GET" => cmd_resrc_get(inst, argv),
        "HOPPER.RESRC.SET" => cmd_resrc_set(inst, argv),
        "HOPPER.CONFIG.GET" => cmd_config_get(inst, argv),
        "HOPPER.CONFIG.SET" => cmd_config_set(inst, argv),
        "HOPPER.GHOST.SAVE" => cmd_ghost_save(inst, argv),
        "HOPPER.GHOST.LOAD" => cmd_ghost_load(inst, argv),
        "HOPPER.BARRIER.WAIT" => cmd_barrier_wait(inst, argv),
        "HOPPER.BARRIER.SIGNAL" => cmd_barrier_signal(inst, argv),
        "HOPPER.BARRIER.COUNT" => cmd_barrier_count(inst, argv),
        _ => Reply::err(format!("unknown command '{cmd}'")),
    }
}

fn cmd_get(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 2 {
        return Reply::wrong_arity("hopper.get");
    }
    match inst.get(&argv[1]) {
        Ok(value) => Reply::Bulk(value),
        Err(Error::Storage(StorageError::Get(_))) => Reply::err("Fail to get from DynamoDB"),
        Err(e) => Reply::err(e.to_string()),
    }
}

fn cmd_set(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 3 {
        return Reply::wrong_arity("hopper.set");
    }
    match inst.set(&argv[1], argv[2].clone()) {
        Ok(()) => Reply::ok(),
        Err(Error::Storage(StorageError::Put(msg))) => {
            Reply::err(format!("Fail to set to DynamoDB: {msg}"))
        }
        Err(e) => Reply::err(e.to_string()),
    }
}

fn cmd_setc(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 3 {
        return Reply::wrong_arity("hopper.setc");
    }
    match inst.setc(&argv[1], argv[2].clone()) {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::err(e.to_string()),
    }
}

fn cmd_load(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 2 {
        return Reply::wrong_arity("hopper.load");
    }
    let path = String::from_utf8_lossy(&argv[1]).into_owned();
    match inst.load(std::path::Path::new(&path)) {
        Ok(()) => Reply::ok(),
        Err(Error::Io(_)) => Reply::err("Failed to open file"),
        Err(Error::Parse(_)) => Reply::err("Invalid image file format"),
        Err(e) => Reply::err(e.to_string()),
    }
}

fn cmd_stats(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.stats");
    }
    let (stats, report) = inst.stats_report();

    let mut out = Vec::with_capacity(24);
    push_ghost_stats(&mut out, report);

    out.push(Reply::label("req_cnt"));
    out.push(Reply::Int(stats.req_cnt as i64));
    out.push(Reply::label("hit_cnt"));
    out.push(Reply::Int(stats.hit_cnt as i64));
    out.push(Reply::label("miss_cnt"));
    out.push(Reply::Int(stats.miss_cnt as i64));

    out.push(Reply::label("db_rcu_consump_if_miss"));
    out.push(Reply::Int(stats.db_rcu_consump_if_miss as i64));
    out.push(Reply::label("net_bw_consump_if_miss"));
    out.push(Reply::Int(stats.net_bw_consump_if_miss as i64));
    out.push(Reply::label("net_bw_consump_if_hit"));
    out.push(Reply::Int(stats.net_bw_consump_if_hit as i64));

    out.push(Reply::label("db_rcu_consump"));
    out.push(Reply::Int(stats.db_rcu_consump as i64));
    out.push(Reply::label("db_wcu_consump"));
    out.push(Reply::Int(stats.db_wcu_consump as i64));
    out.push(Reply::label("net_bw_consump"));
    out.push(Reply::Int(stats.net_bw_consump as i64));

    Reply::Array(out)
}

fn push_ghost_stats(out: &mut Vec<Reply>, report: Option<MrcReport>) {
    match report {
        None => {
            out.push(Reply::label("ghost.ticks"));
            out.push(Reply::Null);
            out.push(Reply::label("ghost.hit_cnt"));
            out.push(Reply::Null);
            out.push(Reply::label("ghost.miss_cnt"));
            out.push(Reply::Null);
        }
        Some(report) => {
            out.push(Reply::label("ghost.ticks"));
            out.push(Reply::Array(
                report.ticks.iter().map(|&t| Reply::Int(t as i64)).collect(),
            ));
            out.push(Reply::label("ghost.hit_cnt"));
            out.push(Reply::Array(
                report.hit_cnt.iter().map(|&h| Reply::Int(h as i64)).collect(),
            ));
            out.push(Reply::label("ghost.miss_cnt"));
            out.push(Reply::Array(
                report.miss_cnt.iter().map(|&m| Reply::Int(m as i64)).collect(),
            ));
        }
    }
}

fn cmd_resrc_get(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.resrc.get");
    }
    let caps = inst.resrc_get();
    Reply::Array(vec![
        Reply::Int(caps.cache_size as i64),
        Reply::Double(caps.db_rcu),
        Reply::Double(caps.db_wcu),
        Reply::Double(caps.net_bw),
    ])
}

fn cmd_resrc_set(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 5 {
        return Reply::wrong_arity("hopper.resrc.set");
    }
    let Some(cache_size) = parse_arg::<i64>(&argv[1]) else {
        return Reply::err("Fail to parse <cache_size>");
    };
    let Some(db_rcu) = parse_arg::<f64>(&argv[2]) else {
        return Reply::err("Fail to parse <db_rcu>");
    };
    let Some(db_wcu) = parse_arg::<f64>(&argv[3]) else {
        return Reply::err("Fail to parse <db_wcu>");
    };
    let Some(net_bw) = parse_arg::<f64>(&argv[4]) else {
        return Reply::err("Fail to parse <net_bw>");
    };
    inst.resrc_set(cache_size, db_rcu, db_wcu, net_bw);
    Reply::ok()
}

fn cmd_config_get(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.config.get");
    }
    let format = inst.storage().mock_format();
    let range = inst.ghost_range();

    Reply::Array(vec![
        Reply::label("policy.alloc_total_net_bw"),
        Reply::bool(ALLOC_TOTAL_NET_BW),
        Reply::label("dynamo.table"),
        Reply::Bulk(Bytes::from(inst.storage().table())),
        Reply::label("dynamo.mock"),
        Reply::bool(inst.storage().is_mock()),
        Reply::label("dynamo.mock_format"),
        Reply::Array(vec![
            Reply::Int(format.key_size as i64),
            Reply::Int(format.val_size as i64),
            Reply::Int(format.size_len as i64),
            Reply::Int(format.offset_len as i64),
            Reply::Int(format.k_pad_len as i64),
            Reply::Int(format.v_pad_len as i64),
        ]),
        Reply::label("cache.admit_write"),
        Reply::bool(inst.admit_write()),
        Reply::label("ghost.range"),
        Reply::Array(vec![
            Reply::Int(range.tick as i64),
            Reply::Int(range.min_tick as i64),
            Reply::Int(range.max_tick as i64),
        ]),
    ])
}

fn cmd_config_set(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() < 3 {
        return Reply::wrong_arity("hopper.config.set");
    }
    let name = String::from_utf8_lossy(&argv[1]).into_owned();

    match name.as_str() {
        "dynamo.table" => {
            if argv.len() != 3 {
                return Reply::wrong_arity("hopper.config.set");
            }
            inst.storage()
                .set_table(String::from_utf8_lossy(&argv[2]).into_owned());
        }
        "dynamo.mock" => {
            // sub-options:
            //   dynamo.mock disable
            //   dynamo.mock image <file...>
            //   dynamo.mock format <key_size> <val_size>
            let option = String::from_utf8_lossy(&argv[2]).into_owned();
            match option.as_str() {
                "disable" => {
                    if argv.len() != 3 {
                        return Reply::wrong_arity("hopper.config.set");
                    }
                    inst.storage().disable_mock();
                }
                "image" => {
                    let paths: Vec<std::path::PathBuf> = argv[3..]
                        .iter()
                        .map(|a| String::from_utf8_lossy(a).into_owned().into())
                        .collect();
                    match inst.storage().enable_mock_image(&paths) {
                        Ok(()) => {}
                        Err(Error::Io(_)) => return Reply::err("Failed to open image file"),
                        Err(_) => return Reply::err("Invalid image file format"),
                    }
                }
                "format" => {
                    if argv.len() != 5 {
                        return Reply::wrong_arity("hopper.config.set");
                    }
                    let Some(key_size) = parse_arg::<u32>(&argv[3]) else {
                        return Reply::err("Invalid `key_size` for <dynamo.mock>");
                    };
                    let Some(val_size) = parse_arg::<u32>(&argv[4]) else {
                        return Reply::err("Invalid `val_size` for <dynamo.mock>");
                    };
                    if let Err(e) = inst.storage().enable_mock_format(key_size, val_size) {
                        return Reply::err(format!("Ill-formed key-value format: {e}"));
                    }
                }
                _ => return Reply::err("Invalid option for <dynamo.mock>"),
            }
        }
        "cache.admit_write" => {
            if argv.len() != 3 {
                return Reply::wrong_arity("hopper.config.set");
            }
            match &argv[2][..] {
                b"true" => inst.set_admit_write(true),
                b"false" => inst.set_admit_write(false),
                _ => return Reply::err("Invalid value for <cache.admit_write>"),
            }
        }
        "ghost.range" => {
            if argv.len() != 5 {
                return Reply::wrong_arity("hopper.config.set");
            }
            let Some(tick) = parse_arg::<u32>(&argv[2]) else {
                return Reply::err("Invalid value for <ghost.range:tick>");
            };
            let Some(min_tick) = parse_arg::<u32>(&argv[3]) else {
                return Reply::err("Invalid value for <ghost.range:min_tick>");
            };
            let Some(max_tick) = parse_arg::<u32>(&argv[4]) else {
                return Reply::err("Invalid value for <ghost.range:max_tick>");
            };
            let tick = round_tick(tick, GHOST_SAMPLE_SHIFT);
            let min_tick = round_tick(min_tick, GHOST_SAMPLE_SHIFT);
            let mut max_tick = round_tick(max_tick, GHOST_SAMPLE_SHIFT);
            if tick == 0 || min_tick == 0 || max_tick < min_tick {
                return Reply::err("Invalid value for <ghost.range>");
            }
            // trim the range to a whole number of ticks
            max_tick = min_tick + (max_tick - min_tick) / tick * tick;
            let range = GhostRange {
                tick,
                min_tick,
                max_tick,
            };
            if let Err(e) = inst.set_ghost_range(range) {
                return Reply::err(e.to_string());
            }
        }
        "policy.alloc_total_net_bw" => {
            return Reply::err("<policy.alloc_total_net_bw> is not configurable");
        }
        _ => return Reply::err("unrecognized config"),
    }

    Reply::ok()
}

fn cmd_ghost_save(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.ghost.save");
    }
    match inst.ghost_save() {
        Ok(()) => Reply::ok(),
        Err(_) => Reply::err("Fail to open dump.ghc file"),
    }
}

fn cmd_ghost_load(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.ghost.load");
    }
    match inst.ghost_load() {
        Ok(()) => Reply::ok(),
        Err(Error::Checkpoint(CheckpointError::Incompatible)) => {
            Reply::err("Detect incompatible dump.ghc")
        }
        Err(_) => Reply::err("Fail to open dump.ghc file"),
    }
}

fn cmd_barrier_wait(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.barrier.wait");
    }
    inst.barrier().wait();
    Reply::ok()
}

fn cmd_barrier_signal(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.barrier.signal");
    }
    inst.barrier().signal();
    Reply::ok()
}

fn cmd_barrier_count(inst: &CacheInstance, argv: &[Bytes]) -> Reply {
    if argv.len() != 1 {
        return Reply::wrong_arity("hopper.barrier.count");
    }
    Reply::Int(inst.barrier().count() as i64)
}

fn parse_arg<T: std::str::FromStr>(arg: &Bytes) -> Option<T> {
    std::str::from_utf8(arg).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamoConfig, InstanceConfig};

    fn argv(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    fn mock_instance() -> (CacheInstance, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = InstanceConfig {
            dynamo: DynamoConfig {
                table: "t".into(),
                mock: true,
            },
            dump_path: dir.path().join("dump.ghc"),
            ..InstanceConfig::new()
        };
        (CacheInstance::new(config, None).unwrap(), dir)
    }

    #[test]
    fn test_get_set_round_trip() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.SET", "K0000000001s016L", "value1"]));
        assert_eq!(r, Reply::Simple("OK".into()));
        let r = dispatch(&inst, &argv(&["hopper.get", "K0000000001s016L"]));
        assert_eq!(r, Reply::Bulk(Bytes::from_static(b"value1")));
    }

    #[test]
    fn test_wrong_arity() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.GET"]));
        assert!(matches!(r, Reply::Error(ref m) if m.contains("wrong number of arguments")));
    }

    #[test]
    fn test_unknown_command() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.NOPE"]));
        assert!(matches!(r, Reply::Error(_)));
    }

    #[test]
    fn test_stats_is_24_elements() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.STATS"]));
        let Reply::Array(elems) = r else {
            panic!("expected array")
        };
        assert_eq!(elems.len(), 24);
        // cold instance: ghost arrays are null
        assert_eq!(elems[0], Reply::Simple("ghost.ticks".into()));
        assert_eq!(elems[1], Reply::Null);
    }

    #[test]
    fn test_resrc_set_and_get() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.RESRC.SET", "1048576", "100", "50", "8192"]));
        assert_eq!(r, Reply::Simple("OK".into()));
        let r = dispatch(&inst, &argv(&["HOPPER.RESRC.GET"]));
        let Reply::Array(elems) = r else {
            panic!("expected array")
        };
        assert_eq!(elems[0], Reply::Int(1048576));
        assert_eq!(elems[1], Reply::Double(100.0));
    }

    #[test]
    fn test_resrc_set_parse_error() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.RESRC.SET", "x", "1", "1", "1"]));
        assert!(matches!(r, Reply::Error(ref m) if m.contains("cache_size")));
    }

    #[test]
    fn test_config_get_shape() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.CONFIG.GET"]));
        let Reply::Array(elems) = r else {
            panic!("expected array")
        };
        assert_eq!(elems.len(), 12);
        assert_eq!(elems[0], Reply::Simple("policy.alloc_total_net_bw".into()));
    }

    #[test]
    fn test_config_set_policy_is_readonly() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(
            &inst,
            &argv(&["HOPPER.CONFIG.SET", "policy.alloc_total_net_bw", "false"]),
        );
        assert!(matches!(r, Reply::Error(ref m) if m.contains("not configurable")));
    }

    #[test]
    fn test_config_set_unknown_name() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.CONFIG.SET", "nope.nope", "1"]));
        assert!(matches!(r, Reply::Error(ref m) if m.contains("unrecognized config")));
    }

    #[test]
    fn test_config_set_ghost_range_rounds_ticks() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(
            &inst,
            &argv(&["HOPPER.CONFIG.SET", "ghost.range", "1000", "1000", "10000"]),
        );
        assert_eq!(r, Reply::Simple("OK".into()));
        let range = inst.ghost_range();
        assert_eq!(range.tick % (1 << GHOST_SAMPLE_SHIFT), 0);
        assert_eq!(range.tick, 992);
    }

    #[test]
    fn test_barrier_count() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.BARRIER.COUNT"]));
        assert_eq!(r, Reply::Int(0));
    }

    #[test]
    fn test_admit_write_toggle() {
        let (inst, _dir) = mock_instance();
        let r = dispatch(&inst, &argv(&["HOPPER.CONFIG.SET", "cache.admit_write", "false"]));
        assert_eq!(r, Reply::Simple("OK".into()));
        assert!(!inst.admit_write());
        let r = dispatch(&inst, &argv(&["HOPPER.CONFIG.SET", "cache.admit_write", "maybe"]));
        assert!(matches!(r, Reply::Error(_)));
    }
}
