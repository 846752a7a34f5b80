use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Type-level marker for the physical coordinate space of the display pipe
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the coordinate space of a pixel buffer
#[derive(Debug)]
pub struct BufferCoords;

/// Trait for types serving as a coordinate for the geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A coordinate that is 0
    const ZERO: Self;

    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Convert to this coordinate from a f64
    fn from_f64(v: f64) -> Self;

    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }

    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl Coordinate for f32 {
    const ZERO: f32 = 0.0;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

/// A point in a coordinate space denoted by the `Kind` marker
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

/// A two-dimensional extent in a coordinate space denoted by the `Kind` marker
pub struct Size<N, Kind> {
    /// horizontal extent
    pub w: N,
    /// vertical extent
    pub h: N,
    _kind: PhantomData<Kind>,
}

/// An axis-aligned rectangle in a coordinate space denoted by the `Kind` marker
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner
    pub loc: Point<N, Kind>,
    /// Extent of the rectangle
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Point<N, Kind> {
    /// A point at (0, 0)
    pub fn zero() -> Self {
        (N::ZERO, N::ZERO).into()
    }
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// A size of (0, 0)
    pub fn zero() -> Self {
        (N::ZERO, N::ZERO).into()
    }

    /// Whether either extent is not strictly positive
    pub fn is_empty(&self) -> bool {
        !(self.w > N::ZERO && self.h > N::ZERO)
    }
}

impl<N: Coordinate, Kind> Add for Point<N, Kind> {
    type Output = Point<N, Kind>;

    #[inline]
    fn add(self, other: Point<N, Kind>) -> Self {
        (self.x + other.x, self.y + other.y).into()
    }
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// An empty rectangle at (0, 0)
    pub fn zero() -> Self {
        Rectangle {
            loc: Point::zero(),
            size: Size::zero(),
        }
    }

    /// Create a rectangle from its top-left corner and its size
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a rectangle from the coordinates of its top-left and bottom-right corners
    pub fn from_extents(topleft: impl Into<Point<N, Kind>>, bottomright: impl Into<Point<N, Kind>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: (bottomright.x - topleft.x, bottomright.y - topleft.y).into(),
        }
    }

    /// Whether this rectangle covers no area
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Whether a given point is inside this rectangle
    pub fn contains(self, point: impl Into<Point<N, Kind>>) -> bool {
        let p: Point<N, Kind> = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x + self.size.w)
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y + self.size.h)
    }

    /// Whether this rectangle and `other` cover at least one common point
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();
        if self.is_empty() || other.is_empty() {
            return false;
        }

        self.loc.x < other.loc.x + other.size.w
            && other.loc.x < self.loc.x + self.size.w
            && self.loc.y < other.loc.y + other.size.h
            && other.loc.y < self.loc.y + self.size.h
    }

    /// Intersection of this rectangle and `other`, if any
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extents(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (
                (self.loc.x + self.size.w).min(other.loc.x + other.size.w),
                (self.loc.y + self.size.h).min(other.loc.y + other.size.h),
            ),
        ))
    }

    /// Smallest rectangle containing both this rectangle and `other`.
    ///
    /// An empty rectangle does not grow the result.
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rectangle::from_extents(
            (self.loc.x.min(other.loc.x), self.loc.y.min(other.loc.y)),
            (
                (self.loc.x + self.size.w).max(other.loc.x + other.size.w),
                (self.loc.y + self.size.h).max(other.loc.y + other.size.h),
            ),
        )
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Self {
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> From<((N, N), (N, N))> for Rectangle<N, Kind> {
    #[inline]
    fn from((loc, size): ((N, N), (N, N))) -> Self {
        Rectangle::from_loc_and_size(loc, size)
    }
}

macro_rules! geometry_impls {
    ($ty:ident; $($field:ident),+) => {
        impl<N: Copy, Kind> Copy for $ty<N, Kind> {}

        impl<N: Copy, Kind> Clone for $ty<N, Kind> {
            #[inline]
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<N: PartialEq, Kind> PartialEq for $ty<N, Kind> {
            fn eq(&self, other: &Self) -> bool {
                true $(&& self.$field == other.$field)+
            }
        }

        impl<N: Eq, Kind> Eq for $ty<N, Kind> {}

        impl<N: fmt::Debug, Kind> fmt::Debug for $ty<N, Kind> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))+
                    .finish()
            }
        }
    };
}

geometry_impls!(Point; x, y);
geometry_impls!(Size; w, h);
geometry_impls!(Rectangle; loc, size);

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        Point {
            x: Default::default(),
            y: Default::default(),
            _kind: PhantomData,
        }
    }
}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Size {
            w: Default::default(),
            h: Default::default(),
            _kind: PhantomData,
        }
    }
}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}
