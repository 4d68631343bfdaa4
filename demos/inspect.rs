use anyhow::Result;
use clap::Parser;
use cta_layout::{ContextBuilder, LayoutInterface, ScalarType};
use itertools::Itertools;
#[cfg(feature = "trace")]
use tracing_subscriber::layer::SubscriberExt;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A layout in textual form, e.g. `#blocked<{sizePerThread = [1, 4], ...}>`.
    layout: String,
    /// Tensor shape, comma separated.
    #[arg(short, long, value_delimiter = ',', default_value = "64,64")]
    shape: Vec<i64>,
    #[arg(short, long, default_value = "f16")]
    ty: ScalarType,
    /// Print the threads owning each element of one CTA's share.
    #[arg(short, long, action)]
    owners: bool,
    #[arg(short, long, action)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        true => log::LevelFilter::Debug,
        false => log::LevelFilter::Info,
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("cta_layout", level)
        .with_module_level("inspect", level)
        .init()?;
    #[cfg(feature = "trace")]
    {
        let layer = tracing_subscriber::fmt::layer()
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .with_writer(std::io::stderr);
        let registry = tracing_subscriber::registry().with(layer);
        tracing::subscriber::set_global_default(registry)?;
    }

    let context = ContextBuilder::new().build();
    let layout = context.parse_layout(&cli.layout)?;
    println!("{layout}");
    println!("{:#?}", layout.encoding());

    let shape = &cli.shape;
    let shape_per_cta = layout.shape_per_cta(shape)?;
    println!("shape per CTA: {shape_per_cta:?}");

    match layout.elems_per_thread(shape, cli.ty) {
        Ok(elems) => println!("elements per thread: {elems:?}"),
        Err(err) => log::warn!("{err}"),
    }
    match layout.total_elems_per_thread(shape, cli.ty) {
        Ok(total) => println!("total elements per thread: {total}"),
        Err(err) => log::warn!("{err}"),
    }

    if cli.owners {
        let owners = layout.owners(&shape_per_cta)?;
        let columns = shape_per_cta.last().copied().unwrap_or(1).max(1) as usize;
        for row in &owners.into_iter().chunks(columns) {
            let line = row
                .map(|threads| format!("{{{}}}", threads.iter().join(",")))
                .join(" ");
            println!("{line}");
        }
    }

    Ok(())
}
