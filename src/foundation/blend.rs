/// Scaling factor for one side of the per-pixel compositing equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SourceColor,
    OneMinusSourceColor,
    SourceAlpha,
    OneMinusSourceAlpha,
    DestinationColor,
    OneMinusDestinationColor,
    DestinationAlpha,
    OneMinusDestinationAlpha,
}

/// How the scaled source and destination terms combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
}

/// The six independent knobs of the compositing equation:
/// factors for {source, destination} x {rgb, alpha} plus an operation per
/// component group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blend {
    pub factor_source_rgb: BlendFactor,
    pub factor_source_alpha: BlendFactor,
    pub factor_destination_rgb: BlendFactor,
    pub factor_destination_alpha: BlendFactor,
    pub operation_rgb: BlendOperation,
    pub operation_alpha: BlendOperation,
}

impl Default for Blend {
    fn default() -> Self {
        Self::SOURCE_OVER
    }
}

const fn separable(src: BlendFactor, dst: BlendFactor) -> Blend {
    Blend {
        factor_source_rgb: src,
        factor_source_alpha: src,
        factor_destination_rgb: dst,
        factor_destination_alpha: dst,
        operation_rgb: BlendOperation::Add,
        operation_alpha: BlendOperation::Add,
    }
}

/// CSS-style compositing presets over premultiplied alpha.
impl Blend {
    pub const SOURCE_OVER: Self =
        separable(BlendFactor::One, BlendFactor::OneMinusSourceAlpha);
    pub const CLEAR: Self = separable(BlendFactor::Zero, BlendFactor::Zero);
    pub const COPY: Self = separable(BlendFactor::One, BlendFactor::Zero);
    pub const DESTINATION: Self = separable(BlendFactor::Zero, BlendFactor::One);
    pub const DESTINATION_OVER: Self =
        separable(BlendFactor::OneMinusDestinationAlpha, BlendFactor::One);
    pub const SOURCE_IN: Self = separable(BlendFactor::DestinationAlpha, BlendFactor::Zero);
    pub const DESTINATION_IN: Self = separable(BlendFactor::Zero, BlendFactor::SourceAlpha);
    pub const SOURCE_OUT: Self =
        separable(BlendFactor::OneMinusDestinationAlpha, BlendFactor::Zero);
    pub const DESTINATION_OUT: Self =
        separable(BlendFactor::Zero, BlendFactor::OneMinusSourceAlpha);
    pub const SOURCE_ATOP: Self = separable(
        BlendFactor::DestinationAlpha,
        BlendFactor::OneMinusSourceAlpha,
    );
    pub const DESTINATION_ATOP: Self = separable(
        BlendFactor::OneMinusDestinationAlpha,
        BlendFactor::SourceAlpha,
    );
    pub const XOR: Self = separable(
        BlendFactor::OneMinusDestinationAlpha,
        BlendFactor::OneMinusSourceAlpha,
    );
    pub const LIGHTER: Self = separable(BlendFactor::One, BlendFactor::One);
    pub const MULTIPLY: Self = separable(BlendFactor::DestinationColor, BlendFactor::Zero);
}

impl BlendFactor {
    /// Evaluates the factor for one channel, all values premultiplied [0, 1].
    pub fn eval(self, src: f32, src_alpha: f32, dst: f32, dst_alpha: f32) -> f32 {
        match self {
            BlendFactor::Zero => 0.0,
            BlendFactor::One => 1.0,
            BlendFactor::SourceColor => src,
            BlendFactor::OneMinusSourceColor => 1.0 - src,
            BlendFactor::SourceAlpha => src_alpha,
            BlendFactor::OneMinusSourceAlpha => 1.0 - src_alpha,
            BlendFactor::DestinationColor => dst,
            BlendFactor::OneMinusDestinationColor => 1.0 - dst,
            BlendFactor::DestinationAlpha => dst_alpha,
            BlendFactor::OneMinusDestinationAlpha => 1.0 - dst_alpha,
        }
    }
}

impl BlendOperation {
    pub fn eval(self, src_term: f32, dst_term: f32) -> f32 {
        match self {
            BlendOperation::Add => src_term + dst_term,
            BlendOperation::Subtract => src_term - dst_term,
            BlendOperation::ReverseSubtract => dst_term - src_term,
        }
    }
}

impl Blend {
    /// Composites one premultiplied RGBA value over another, both in [0, 1].
    pub fn eval(self, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        for ch in 0..3 {
            let sf = self
                .factor_source_rgb
                .eval(src[ch], src[3], dst[ch], dst[3]);
            let df = self
                .factor_destination_rgb
                .eval(src[ch], src[3], dst[ch], dst[3]);
            out[ch] = self
                .operation_rgb
                .eval(src[ch] * sf, dst[ch] * df)
                .clamp(0.0, 1.0);
        }
        let sf = self.factor_source_alpha.eval(src[3], src[3], dst[3], dst[3]);
        let df = self
            .factor_destination_alpha
            .eval(src[3], src[3], dst[3], dst[3]);
        out[3] = self
            .operation_alpha
            .eval(src[3] * sf, dst[3] * df)
            .clamp(0.0, 1.0);
        out
    }
}
