//! Per-frame protocol between a host game and the pipeline.

use crate::foundation::color::Color;
use crate::foundation::error::SpryteResult;
use crate::image::Image;
use crate::pipeline::Pipeline;

pub trait Game {
    /// Advances game state by one tick.
    fn update(&mut self) -> SpryteResult<()>;

    /// Maps the outside (window) size to the logical screen size.
    fn layout(&mut self, outside: (u32, u32)) -> (u32, u32);

    /// Renders one frame onto the screen image.
    fn draw(&mut self, pipeline: &mut Pipeline, screen: &mut Image) -> SpryteResult<()>;
}

/// Drives a [`Game`] against a [`Pipeline`], owning the screen image and
/// recreating it when `layout` changes size.
#[derive(Default)]
pub struct Runner {
    screen: Option<Image>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn screen(&self) -> Option<&Image> {
        self.screen.as_ref()
    }

    /// One frame: frame-start work, `updates` ticks, draw, frame-end work.
    pub fn step<G: Game>(
        &mut self,
        pipeline: &mut Pipeline,
        game: &mut G,
        outside: (u32, u32),
        updates: u32,
    ) -> SpryteResult<()> {
        pipeline.begin_frame()?;

        let (width, height) = game.layout(outside);
        let recreate = match &self.screen {
            Some(screen) => screen.size() != (width, height),
            None => true,
        };
        if recreate {
            if let Some(mut old) = self.screen.take() {
                pipeline.dispose(&mut old)?;
            }
            self.screen = Some(pipeline.new_screen_image(width, height)?);
        }

        for _ in 0..updates {
            game.update()?;
        }

        let mut screen = match self.screen.take() {
            Some(screen) => screen,
            None => unreachable!("screen is created above"),
        };
        let result = (|| {
            pipeline.fill(&mut screen, Color::TRANSPARENT)?;
            game.draw(pipeline, &mut screen)
        })();
        self.screen = Some(screen);
        result?;

        pipeline.end_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::software::SoftwareDriver;
    use crate::pipeline::PipelineOpts;

    struct Counting {
        updates: u32,
        draws: u32,
        layouts: u32,
    }

    impl Game for Counting {
        fn update(&mut self) -> SpryteResult<()> {
            self.updates += 1;
            Ok(())
        }

        fn layout(&mut self, outside: (u32, u32)) -> (u32, u32) {
            self.layouts += 1;
            (outside.0 / 2, outside.1 / 2)
        }

        fn draw(&mut self, pipeline: &mut Pipeline, screen: &mut Image) -> SpryteResult<()> {
            self.draws += 1;
            pipeline.fill(screen, Color::new(0, 0, 255, 255))
        }
    }

    #[test]
    fn step_runs_updates_then_draw() {
        let mut pipeline = Pipeline::new(
            Box::new(SoftwareDriver::new()),
            PipelineOpts::default(),
        );
        let mut runner = Runner::new();
        let mut game = Counting {
            updates: 0,
            draws: 0,
            layouts: 0,
        };
        runner
            .step(&mut pipeline, &mut game, (64, 64), 2)
            .unwrap();
        assert_eq!(game.updates, 2);
        assert_eq!(game.draws, 1);
        let screen = runner.screen().unwrap();
        assert_eq!(screen.size(), (32, 32));
        assert_eq!(
            pipeline.at(screen, 16, 16).unwrap(),
            Color::new(0, 0, 255, 255)
        );
    }

    #[test]
    fn layout_change_recreates_the_screen() {
        let mut pipeline = Pipeline::new(
            Box::new(SoftwareDriver::new()),
            PipelineOpts::default(),
        );
        let mut runner = Runner::new();
        let mut game = Counting {
            updates: 0,
            draws: 0,
            layouts: 0,
        };
        runner.step(&mut pipeline, &mut game, (64, 64), 1).unwrap();
        runner.step(&mut pipeline, &mut game, (128, 128), 1).unwrap();
        assert_eq!(runner.screen().unwrap().size(), (64, 64));
    }
}
