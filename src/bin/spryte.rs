//! Demo binary: renders a small scene with the software driver and writes it
//! out as a PNG.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use spryte::driver::software::SoftwareDriver;
use spryte::{
    Blend, Color, DrawImageOptions, Filter, GeoM, Pipeline, PipelineOpts, Region,
};

#[derive(Parser, Debug)]
#[command(name = "spryte", version)]
struct Cli {
    /// Output PNG path.
    #[arg(long, default_value = "spryte-demo.png")]
    out: PathBuf,

    /// Side of the square output image.
    #[arg(long, default_value_t = 256)]
    size: u32,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut pipeline = Pipeline::new(Box::new(SoftwareDriver::new()), PipelineOpts::default());
    let mut canvas = pipeline.new_image(cli.size, cli.size)?;
    pipeline.fill(&mut canvas, Color::new(24, 24, 32, 255))?;

    // A checkered sprite, drawn a few times at different scales and angles.
    let mut sprite = pipeline.new_image(64, 64)?;
    let mut pixels = Vec::with_capacity(64 * 64 * 4);
    for y in 0..64u32 {
        for x in 0..64u32 {
            let on = (x / 8 + y / 8) % 2 == 0;
            if on {
                pixels.extend_from_slice(&[230, 90, 40, 255]);
            } else {
                pixels.extend_from_slice(&[40, 90, 230, 255]);
            }
        }
    }
    pipeline.replace_pixels(&mut sprite, &pixels)?;

    let placements = [
        (GeoM::scale(2.0, 2.0), GeoM::translate(16.0, 16.0)),
        (GeoM::rotate(0.5), GeoM::translate(170.0, 40.0)),
        (GeoM::scale(0.25, 0.25), GeoM::translate(32.0, 200.0)),
    ];
    for (transform, offset) in placements {
        pipeline.draw_image(
            &mut canvas,
            &sprite,
            &DrawImageOptions {
                geom: offset.concat(transform),
                filter: Filter::Linear,
                blend: Blend::SOURCE_OVER,
                ..DrawImageOptions::default()
            },
        )?;
    }

    // A sub-image view of one checker cell, tiled along the bottom edge.
    let cell = sprite.sub_image(Region::new(0, 0, 8, 8));
    for i in 0..8 {
        pipeline.draw_image(
            &mut canvas,
            &cell,
            &DrawImageOptions {
                geom: GeoM::translate(16.0 * i as f32, (cli.size - 12) as f32),
                ..DrawImageOptions::default()
            },
        )?;
    }

    let rgba = pipeline.pixels(&canvas)?;
    let (width, height) = canvas.size();
    let buffer = image::RgbaImage::from_raw(width, height, rgba)
        .context("pixel buffer does not match the canvas size")?;
    buffer
        .save(&cli.out)
        .with_context(|| format!("writing {}", cli.out.display()))?;
    println!("wrote {}", cli.out.display());
    Ok(())
}
