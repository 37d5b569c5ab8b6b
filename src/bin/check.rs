use std::ffi::OsString;
use std::path::PathBuf;

use color_eyre::eyre::{bail, eyre, Report, WrapErr};
use yamp::{ConfigLoader, PrometheusClient};

const USAGE: &str = "Usage: yamp-check [-c <config file>]";

/// `-c <path>` overrides `YAMP_CONFIG_PATH`; anything else is rejected.
fn config_file_arg(args: impl IntoIterator<Item = OsString>) -> Result<Option<PathBuf>, Report> {
    let mut args = args.into_iter();
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("-c" | "--config") => {
                let p = args
                    .next()
                    .ok_or_else(|| eyre!("-c requires a path\n{USAGE}"))?;
                path = Some(PathBuf::from(p));
            }
            _ => bail!("Unexpected argument {:?}\n{}", arg, USAGE),
        }
    }
    Ok(path)
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let loader = match config_file_arg(std::env::args_os().skip(1))? {
        Some(path) => ConfigLoader::from_env().with_path(path),
        None => ConfigLoader::from_env(),
    };
    let cfg = loader.load().wrap_err("load configuration")?;
    let mut client = PrometheusClient::try_from(&cfg)?;
    rt.block_on(async move {
        let session = client.session()?;
        for dashboard in &cfg.dashboards {
            for metric in &dashboard.metrics {
                let samples = match session.fetch_metric(&metric.query).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(dashboard = %dashboard.name, metric = %metric.title, err = %e, "query failed");
                        continue;
                    }
                };
                for sample in samples {
                    println!(
                        "{} / {}: {:?} = {} {}",
                        dashboard.name, metric.title, sample.labels, sample.value, metric.unit
                    );
                }
            }
        }
        Ok::<_, Report>(())
    })?;
    Ok(())
}
