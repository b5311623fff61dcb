use crate::mercator::{Mercator, MercatorBounds, mercator_to_tile};
use crate::tile::{TileCoord, TileRange};

/// Dataset extent, answered per zoom as the minimal covering tile range.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DataBounds {
    extent: MercatorBounds,
}

impl DataBounds {
    pub fn new(extent: MercatorBounds) -> Self {
        DataBounds { extent }
    }

    pub fn extent(&self) -> MercatorBounds {
        self.extent
    }

    pub fn range_at(&self, z: u8) -> TileRange {
        let (min_x, min_y) = mercator_to_tile(
            Mercator {
                x: self.extent.min_x,
                y: self.extent.max_y,
            },
            z,
        );
        let (max_x, max_y) = mercator_to_tile(
            Mercator {
                x: self.extent.max_x,
                y: self.extent.min_y,
            },
            z,
        );
        TileRange::new(z, min_x, max_x, min_y, max_y)
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        self.range_at(coord.z).contains(coord)
    }
}
