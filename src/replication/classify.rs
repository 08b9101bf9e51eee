// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Which operations mutate state and therefore need mirroring.
//!
//! Key-value commands are looked up in a closed set; a few read commands
//! become writes when given a storing option. Relational statements are
//! classified by their leading keyword.

use crate::operation::{Dialect, Operation};

/// Mutating key-value commands. Must stay sorted (binary searched).
const WRITE_COMMANDS: &[&str] = &[
    "APPEND", "BITOP", "BLMOVE", "BLMPOP", "BLPOP", "BRPOP", "BRPOPLPUSH", "BZMPOP",
    "BZPOPMAX", "BZPOPMIN", "COPY", "DECR", "DECRBY", "DEL", "EVAL", "EVALSHA", "EXPIRE",
    "EXPIREAT", "FCALL", "FLUSHALL", "FLUSHDB", "GEOADD", "GEOSEARCHSTORE", "GETDEL",
    "GETEX", "GETSET", "HDEL", "HINCRBY", "HINCRBYFLOAT", "HMSET", "HSET", "HSETNX",
    "INCR", "INCRBY", "INCRBYFLOAT", "LINSERT", "LMOVE", "LMPOP", "LPOP", "LPUSH",
    "LPUSHX", "LREM", "LSET", "LTRIM", "MIGRATE", "MOVE", "MSET", "MSETNX", "PERSIST",
    "PEXPIRE", "PEXPIREAT", "PFADD", "PFMERGE", "PSETEX", "RENAME", "RENAMENX", "RESTORE",
    "RPOP", "RPOPLPUSH", "RPUSH", "RPUSHX", "SADD", "SDIFFSTORE", "SET", "SETBIT", "SETEX",
    "SETNX", "SETRANGE", "SINTERSTORE", "SMOVE", "SPOP", "SREM", "SUNIONSTORE", "SWAPDB",
    "UNLINK", "XACK", "XADD", "XAUTOCLAIM", "XCLAIM", "XDEL", "XGROUP", "XREADGROUP",
    "XSETID", "XTRIM", "ZADD", "ZDIFFSTORE", "ZINCRBY", "ZINTERSTORE", "ZMPOP", "ZPOPMAX",
    "ZPOPMIN", "ZRANGESTORE", "ZREM", "ZREMRANGEBYLEX", "ZREMRANGEBYRANK",
    "ZREMRANGEBYSCORE", "ZUNIONSTORE",
];

/// Leading keywords of statements that only read.
const READ_KEYWORDS: &[&str] = &["DESC", "DESCRIBE", "EXPLAIN", "SELECT", "SHOW"];

pub fn is_write(op: &Operation, dialect: Dialect) -> bool {
    match dialect {
        Dialect::KeyValue => is_kv_write(op),
        Dialect::Relational => is_sql_write(&op.name),
    }
}

fn has_arg(op: &Operation, options: &[&str]) -> bool {
    (0..op.args.len())
        .filter_map(|i| op.arg_str(i))
        .any(|a| options.iter().any(|o| a.eq_ignore_ascii_case(o)))
}

fn is_kv_write(op: &Operation) -> bool {
    let command = op.command();
    if WRITE_COMMANDS.binary_search(&command.as_str()).is_ok() {
        return true;
    }
    match command.as_str() {
        "SORT" => has_arg(op, &["STORE"]),
        "GEORADIUS" | "GEORADIUSBYMEMBER" => has_arg(op, &["STORE", "STOREDIST"]),
        "BITFIELD" => has_arg(op, &["SET", "INCRBY"]),
        _ => false,
    }
}

/// Strip leading whitespace, `--`/`/* */` comments and opening parens.
fn statement_body(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return trimmed;
        }
    }
}

fn is_sql_write(sql: &str) -> bool {
    let body = statement_body(sql);
    let upper = body.to_ascii_uppercase();
    let keyword = upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default();

    let words: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    let locks_rows = words.windows(2).any(|w| w == ["FOR", "UPDATE"]);

    if READ_KEYWORDS.contains(&keyword) {
        return locks_rows;
    }
    if keyword == "WITH" {
        let mutates = words
            .iter()
            .any(|w| matches!(*w, "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE"));
        return mutates || locks_rows;
    }
    true
}
