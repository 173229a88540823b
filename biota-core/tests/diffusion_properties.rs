//! Property-based tests for coordinate generalisation.
//!
//! # Invariants tested
//!
//! - **Idempotence:** generalising twice equals generalising once.
//! - **Determinism:** identical inputs give bit-identical outputs.
//! - **Cell sharing:** points in one grid cell share one output.
//! - **Bounded shift:** output stays valid WGS84, including cells that
//!   straddle the antimeridian.

use biota_core::{generalize, is_valid_wgs84};
use geo::Coord;
use proptest::prelude::*;

fn coordinate() -> impl Strategy<Value = Coord<f64>> {
    (-179.0_f64..179.0, -85.0_f64..85.0).prop_map(|(x, y)| Coord { x, y })
}

fn antimeridian_coordinate() -> impl Strategy<Value = Coord<f64>> {
    (
        prop_oneof![179.0_f64..=180.0, -180.0_f64..=-179.0],
        -85.0_f64..85.0,
    )
        .prop_map(|(x, y)| Coord { x, y })
}

fn radius() -> impl Strategy<Value = u32> {
    prop_oneof![Just(1_000_u32), Just(5_000), Just(25_000), Just(50_000), 100_u32..100_000]
}

fn same_bits(left: Coord<f64>, right: Coord<f64>) -> bool {
    left.x.to_bits() == right.x.to_bits() && left.y.to_bits() == right.y.to_bits()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn generalisation_is_idempotent(point in coordinate(), radius_m in radius()) {
        let once = generalize(point, radius_m);
        let twice = generalize(once, radius_m);
        prop_assert!(same_bits(once, twice), "{once:?} became {twice:?}");
    }

    #[test]
    fn generalisation_is_deterministic(point in coordinate(), radius_m in radius()) {
        prop_assert!(same_bits(generalize(point, radius_m), generalize(point, radius_m)));
    }

    #[test]
    fn generalised_points_stay_in_range(point in coordinate(), radius_m in radius()) {
        prop_assert!(is_valid_wgs84(generalize(point, radius_m)));
    }

    #[test]
    fn points_between_a_point_and_its_centre_share_the_cell(
        point in coordinate(),
        radius_m in radius(),
    ) {
        // The projection is monotonic on both axes, so the midpoint lies in
        // the same cell as the point and its centre.
        let centre = generalize(point, radius_m);
        let midpoint = Coord {
            x: (point.x + centre.x) / 2.0,
            y: (point.y + centre.y) / 2.0,
        };
        prop_assert!(same_bits(generalize(midpoint, radius_m), centre));
    }

    #[test]
    fn antimeridian_cells_stay_in_range(
        point in antimeridian_coordinate(),
        radius_m in radius(),
    ) {
        let once = generalize(point, radius_m);
        prop_assert!(is_valid_wgs84(once), "{point:?} became {once:?}");
        prop_assert!(same_bits(once, generalize(once, radius_m)));
    }
}
