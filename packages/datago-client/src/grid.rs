//! Conversion from WGS84 coordinates to the KMA forecast grid.
//!
//! The village-forecast service addresses locations by (nx, ny) cells of a
//! Lambert conformal conic projection over the Korean peninsula. Constants
//! follow the published DFS grid definition (5 km cells, origin 38N/126E).

use serde::{Deserialize, Serialize};

/// One cell of the KMA DFS grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPoint {
    pub nx: i32,
    pub ny: i32,
}

const RE: f64 = 6371.00877; // earth radius, km
const GRID: f64 = 5.0; // cell size, km
const SLAT1: f64 = 30.0; // first standard latitude
const SLAT2: f64 = 60.0; // second standard latitude
const OLON: f64 = 126.0; // origin longitude
const OLAT: f64 = 38.0; // origin latitude
const XO: f64 = 43.0; // origin cell x
const YO: f64 = 136.0; // origin cell y

/// Project a latitude/longitude onto the DFS grid.
pub fn to_grid(lat: f64, lon: f64) -> GridPoint {
    let degrad = std::f64::consts::PI / 180.0;

    let re = RE / GRID;
    let slat1 = SLAT1 * degrad;
    let slat2 = SLAT2 * degrad;
    let olon = OLON * degrad;
    let olat = OLAT * degrad;

    let sn = (slat1.cos() / slat2.cos()).ln()
        / ((std::f64::consts::PI * 0.25 + slat2 * 0.5).tan()
            / (std::f64::consts::PI * 0.25 + slat1 * 0.5).tan())
        .ln();

    let sf = {
        let t = (std::f64::consts::PI * 0.25 + slat1 * 0.5).tan();
        t.powf(sn) * slat1.cos() / sn
    };
    let ro = {
        let t = (std::f64::consts::PI * 0.25 + olat * 0.5).tan();
        re * sf / t.powf(sn)
    };

    let ra = {
        let t = (std::f64::consts::PI * 0.25 + lat * degrad * 0.5).tan();
        re * sf / t.powf(sn)
    };
    let mut theta = lon * degrad - olon;
    if theta > std::f64::consts::PI {
        theta -= 2.0 * std::f64::consts::PI;
    }
    if theta < -std::f64::consts::PI {
        theta += 2.0 * std::f64::consts::PI;
    }
    theta *= sn;

    GridPoint {
        nx: (ra * theta.sin() + XO + 0.5).floor() as i32,
        ny: (ro - ra * theta.cos() + YO + 0.5).floor() as i32,
    }
}
