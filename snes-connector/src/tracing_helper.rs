use std::{num::NonZeroU8, panic};

use anyhow::Result;
use time::format_description::well_known::{
    iso8601::{self, EncodedConfig},
    Iso8601,
};
use tracing::error;
use tracing_subscriber::{
    fmt::{self, time::LocalTime},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

const LEVEL: &str = if cfg!(debug_assertions) {
    "trace"
} else {
    "info"
};

fn filter() -> EnvFilter {
    EnvFilter::new(
        [env!("CARGO_CRATE_NAME"), "snes_connector_lib"]
            .map(|krate| format!("{}={}", krate, LEVEL))
            .join(","),
    )
}

pub fn init_tracing() -> Result<()> {
    const WITH_FILE_PATH: bool = cfg!(debug_assertions);
    const TIME_CONFIG: EncodedConfig = iso8601::Config::DEFAULT
        .set_time_precision(iso8601::TimePrecision::Second {
            decimal_digits: NonZeroU8::new(6),
        })
        .encode();
    let layer = fmt::layer()
        .compact()
        .with_file(WITH_FILE_PATH)
        .with_line_number(WITH_FILE_PATH)
        .with_target(!WITH_FILE_PATH)
        .with_thread_ids(true)
        .with_timer(LocalTime::new(Iso8601::<TIME_CONFIG>));
    let reg = tracing_subscriber::registry().with(layer.with_filter(filter()));
    tracing::subscriber::set_global_default(reg)?;
    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}
