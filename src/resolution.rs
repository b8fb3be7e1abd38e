use std::fmt;
use std::str::FromStr;

/// Canonical output qualities. Requested qualities snap to the nearest entry so
/// near-identical requests share one cache entry.
pub const QUALITY_STEPS: [u8; 3] = [80, 85, 90];

/// Quality used when a custom request carries no (parseable) `q`.
pub const DEFAULT_QUALITY: u8 = 85;

/// Named size presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Preset {
    Thumbnail,
    Small,
    #[default]
    Medium,
    Large,
    Original,
}

impl Preset {
    /// `(width, height, quality)` bounds, or `None` for [`Preset::Original`].
    pub fn bounds(self) -> Option<(u32, u32, u8)> {
        match self {
            Preset::Thumbnail => Some((200, 200, 80)),
            Preset::Small => Some((400, 400, 85)),
            Preset::Medium => Some((800, 800, 85)),
            Preset::Large => Some((1024, 1024, 90)),
            Preset::Original => None,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Preset::Thumbnail => write!(f, "thumbnail"),
            Preset::Small => write!(f, "small"),
            Preset::Medium => write!(f, "medium"),
            Preset::Large => write!(f, "large"),
            Preset::Original => write!(f, "original"),
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "thumbnail" => Ok(Preset::Thumbnail),
            "small" => Ok(Preset::Small),
            "medium" => Ok(Preset::Medium),
            "large" => Ok(Preset::Large),
            "original" => Ok(Preset::Original),
            _ => Err(format!("Invalid size preset: {}", s)),
        }
    }
}

/// What the transformation pipeline should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionDescriptor {
    Preset(Preset),
    /// Explicit bounds from `w`/`h`; a missing side is unconstrained.
    Custom {
        width: Option<u32>,
        height: Option<u32>,
        quality: u8,
    },
}

/// Concrete resize target handed to the transformation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
}

impl ResolutionDescriptor {
    /// Builds a descriptor from raw query values.
    ///
    /// Either of `w`/`h` being present switches to a custom descriptor and the
    /// preset (including its quality) is ignored. Unknown preset names fall back
    /// to [`Preset::Medium`]. Zero or non-numeric dimensions count as absent and
    /// dimensions above `max_dimension` are clamped.
    pub fn from_params(
        size: Option<&str>,
        w: Option<&str>,
        h: Option<&str>,
        q: Option<&str>,
        max_dimension: u32,
    ) -> Self {
        let dim = |raw: Option<&str>| {
            raw.and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| *v > 0)
                .map(|v| v.min(max_dimension))
        };
        let width = dim(w);
        let height = dim(h);

        if width.is_some() || height.is_some() {
            let quality = q
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(|v| snap_quality(v.clamp(0, 100) as u8))
                .unwrap_or(DEFAULT_QUALITY);
            return ResolutionDescriptor::Custom { width, height, quality };
        }

        let preset = match size {
            Some(name) => name.parse().unwrap_or_else(|e| {
                tracing::debug!("{}, using {}", e, Preset::default());
                Preset::default()
            }),
            None => Preset::default(),
        };
        ResolutionDescriptor::Preset(preset)
    }

    pub fn is_original(&self) -> bool {
        matches!(self, ResolutionDescriptor::Preset(Preset::Original))
    }

    /// Resize target, or `None` when the image passes through untouched.
    pub fn target(&self) -> Option<Target> {
        match *self {
            ResolutionDescriptor::Preset(p) => p.bounds().map(|(width, height, quality)| Target {
                width: Some(width),
                height: Some(height),
                quality,
            }),
            ResolutionDescriptor::Custom { width, height, quality } => {
                Some(Target { width, height, quality })
            }
        }
    }
}

impl fmt::Display for ResolutionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn side(v: Option<u32>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "auto".into())
        }
        match self {
            ResolutionDescriptor::Preset(p) => write!(f, "{}", p),
            ResolutionDescriptor::Custom { width, height, quality } => {
                write!(f, "w{}-h{}-q{}", side(*width), side(*height), quality)
            }
        }
    }
}

/// Snaps `q` to the nearest of [`QUALITY_STEPS`]; ties go to the lower step.
pub fn snap_quality(q: u8) -> u8 {
    let mut best = QUALITY_STEPS[0];
    for step in QUALITY_STEPS {
        if step.abs_diff(q) < best.abs_diff(q) {
            best = step;
        }
    }
    best
}
