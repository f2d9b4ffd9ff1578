use image::RgbaImage;

/// Absolute screen coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Screen rectangle requested from a capture (absolute, top-left + size)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRect {
    pub l: i32,
    pub t: i32,
    pub w: u32,
    pub h: u32,
}

/// Axis-aligned box in image pixels, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub l: i32,
    pub t: i32,
    pub r: i32,
    pub b: i32,
}

impl BoundingBox {
    pub fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { l: x, t: y, r: x + w, b: y + h }
    }

    pub fn center(&self) -> Point {
        Point::new((self.l + self.r) / 2, (self.t + self.b) / 2)
    }
}

/// A screen grab plus the absolute position of its top-left pixel.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: RgbaImage,
    pub offset: Point,
}

impl Screenshot {
    pub fn new(image: RgbaImage, offset: Point) -> Self {
        Self { image, offset }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Cut out `rect` (image-relative), clamped to the image bounds.
    /// The result keeps absolute coordinates consistent through its offset.
    pub fn crop(&self, l: i32, t: i32, r: i32, b: i32) -> Option<Screenshot> {
        let l = l.max(0);
        let t = t.max(0);
        let r = r.min(self.width() as i32);
        let b = b.min(self.height() as i32);
        if r <= l || b <= t {
            return None;
        }
        let view = image::imageops::crop_imm(&self.image, l as u32, t as u32, (r - l) as u32, (b - t) as u32);
        Some(Screenshot {
            image: view.to_image(),
            offset: self.offset.offset(l, t),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// Parse a button name. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "middle" => Some(Self::Middle),
            _ => None,
        }
    }
}

/// Macro run lifecycle as shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
}

/// Command from TUI to orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartStop,
    Reload,
    Quit,
}
