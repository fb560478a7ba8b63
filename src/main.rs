mod distribution;
mod error;
mod field;
mod guiding;
mod io;
mod objects;
mod path_trace;
mod render;
mod sampling;
mod scene;

use std::process::exit;

use log::{error, info};

use crate::{
    error::RenderError,
    field::FieldArguments,
    guiding::{GuidingConfig, GuidingField},
    io::{read_args, read_scene, save_checkpoint, Args, ImageSink, PngSink},
    render::{render, TraceState, TracerKind},
};

fn run(args: Args) -> Result<(), RenderError> {
    let scene = read_scene(&args.scene)?;
    let mut state = TraceState::new(&scene, &args.params)?;
    let (width, height) = state.size();

    let guiding = match args.params.tracer {
        TracerKind::Guided => {
            let Some(bounds) = scene.bounds() else {
                return Err(RenderError::Params(
                    "guided tracing needs at least one object".to_string(),
                ));
            };
            Some(GuidingField::new(
                FieldArguments::new(args.distribution, bounds),
                GuidingConfig::default(),
            ))
        }
        TracerKind::Path => None,
    };

    info!(
        "rendering {}x{} image with {} samples per pixel ({:?} tracer)",
        width, height, args.params.nsamples, args.params.tracer
    );

    let sink = PngSink {
        tonemap: args.tonemap,
    };
    render(&mut state, &scene, guiding.as_ref(), &args.params, |state| {
        if args.save_batch {
            save_checkpoint(&sink, &args.output, state)?;
        }
        Ok(())
    })?;

    if let Some(guiding) = &guiding {
        info!("guiding field trained for {} iterations", guiding.iterations());
    }

    sink.save(&state.image(), &args.output)?;
    info!("saved {}x{} image to {}", width, height, args.output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = read_args();
    if let Err(err) = run(args) {
        error!("{}", err);
        exit(1);
    }
}
