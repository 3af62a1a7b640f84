use std::{fmt::Write as _, io::Write as _};

use env_logger::{Builder, Env};
use log::kv::{self, Key, Value, VisitSource};

/// Collects a record's key values as ` key=value` pairs.
struct KvLine(String);

impl<'kvs> VisitSource<'kvs> for KvLine {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), kv::Error> {
        write!(self.0, " {key}={value}").map_err(|_| kv::Error::msg("can't format key value"))
    }
}

/// Sets up the global logger, filtered by `RUST_LOG` and defaulting to `info`.
///
/// Lines of a worker are prefixed with its global `rank` so the output of every process
/// of a node can be told apart. Calling it twice is a no-op.
pub fn init(rank: Option<usize>) {
    let prefix = match rank {
        Some(rank) => format!("[rank {rank}]"),
        None => "[launcher]".to_string(),
    };

    let installed = Builder::from_env(Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            let mut kvs = KvLine(String::new());
            let _ = record.key_values().visit(&mut kvs);
            let ts = buf.timestamp_millis();

            writeln!(
                buf,
                "{prefix} {ts} {:<5} {}: {}{}",
                record.level(),
                record.target(),
                record.args(),
                kvs.0
            )
        })
        .try_init();

    if let Err(e) = installed {
        log::debug!("keeping the installed logger: {e}");
    }
}

#[cfg(test)]
mod tests {
    use log::kv::Source;

    use super::*;

    #[test]
    fn key_values_are_appended_in_order() {
        let pairs = [("epoch", 3), ("step", 7)];
        let mut line = KvLine(String::new());
        pairs.as_slice().visit(&mut line).unwrap();

        assert_eq!(line.0, " epoch=3 step=7");
    }

    #[test]
    fn a_second_init_keeps_the_first_logger() {
        init(Some(0));
        init(None);
        log::info!(rank = 0; "still logging");
    }
}
