// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

use std::io;

pub(crate) use tracing::*;
use tracing::{subscriber, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, FmtSubscriber, Layer};

use super::LogsArgs;

/// Install the global subscriber. Logs are written by a background worker
/// that flushes until the returned guard is dropped.
pub(crate) fn configure_logging(config: &LogsArgs) -> anyhow::Result<WorkerGuard> {
    let (writer, guard) = match &config.file {
        Some(log_file) => {
            tracing_appender::non_blocking(tracing_appender::rolling::never(".", log_file))
        }
        None => tracing_appender::non_blocking(io::stdout()),
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(writer);
    if config.json {
        subscriber::set_global_default(builder.json().finish().with(TransportTargetFilter))?;
    } else {
        subscriber::set_global_default(builder.pretty().finish().with(TransportTargetFilter))?;
    }

    // crates logging through `log` end up in the same subscriber
    LogTracer::init()?;

    Ok(guard)
}

const MUTED_TARGETS: &[&str] = &["h2", "hyper", "hyper_util", "reqwest", "tower::buffer"];

struct TransportTargetFilter;

impl<S: Subscriber> Layer<S> for TransportTargetFilter {
    fn register_callsite(&self, metadata: &'static Metadata<'static>) -> Interest {
        if is_muted(metadata.target()) {
            Interest::never()
        } else {
            Interest::always()
        }
    }
}

fn is_muted(target: &str) -> bool {
    MUTED_TARGETS.iter().any(|muted| target.starts_with(muted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutes_transport_targets() {
        assert!(is_muted("hyper::proto::h1"));
        assert!(is_muted("reqwest::connect"));
        assert!(!is_muted("opbundler_builder::relay"));
    }
}
