use super::*;

#[test]
fn grid_side_scales_with_square_root_of_population() {
    assert_eq!(grid_side(2), 2);
    assert_eq!(grid_side(4), 3);
    assert_eq!(grid_side(16), 6);
    assert_eq!(grid_side(100), 15);
}

#[test]
fn corner_cell_reports_out_of_bounds_separately_from_empty() {
    let grid = Grid::new(5, 5);
    let neighbors = grid.find_neighbors(Position::new(0, 0), 10);
    assert_eq!(
        neighbors,
        [
            Neighbor::OutOfBounds,
            Neighbor::OutOfBounds,
            Neighbor::Empty,
            Neighbor::Empty,
        ]
    );
}

#[test]
fn occupied_neighbors_report_their_agent() {
    let mut grid = Grid::new(5, 5);
    assert!(grid.place(Position::new(1, 2), AgentId(4)));
    assert!(grid.place(Position::new(2, 3), AgentId(9)));

    let neighbors = grid.find_neighbors(Position::new(2, 2), 10);
    assert_eq!(neighbors[0], Neighbor::Occupied(AgentId(4)));
    assert_eq!(neighbors[1], Neighbor::Empty);
    assert_eq!(neighbors[2], Neighbor::Occupied(AgentId(9)));
    assert_eq!(neighbors[3], Neighbor::Empty);
}

#[test]
fn far_edges_are_out_of_bounds() {
    let grid = Grid::new(5, 5);
    let neighbors = grid.find_neighbors(Position::new(4, 4), 10);
    assert_eq!(neighbors[2], Neighbor::OutOfBounds);
    assert_eq!(neighbors[3], Neighbor::OutOfBounds);
    assert_eq!(neighbors[0], Neighbor::Empty);
    assert_eq!(neighbors[1], Neighbor::Empty);
}

#[test]
fn small_population_shrinks_right_and_bottom_edges() {
    let grid = Grid::new(5, 5);
    let at = Position::new(3, 3);

    let roomy = grid.find_neighbors(at, 5);
    assert_eq!(roomy[2], Neighbor::Empty);
    assert_eq!(roomy[3], Neighbor::Empty);

    let shrunk = grid.find_neighbors(at, 4);
    assert_eq!(shrunk[2], Neighbor::OutOfBounds);
    assert_eq!(shrunk[3], Neighbor::OutOfBounds);
    assert_eq!(shrunk[0], Neighbor::Empty);
    assert_eq!(shrunk[1], Neighbor::Empty);

    let inner = grid.find_neighbors(Position::new(2, 2), 1);
    assert_eq!(inner[2], Neighbor::Empty);
    assert_eq!(inner[3], Neighbor::Empty);
}

#[test]
fn place_and_vacate_keep_cells_exclusive() {
    let mut grid = Grid::new(3, 3);
    let cell = Position::new(1, 1);
    assert!(grid.place(cell, AgentId(0)));
    assert!(!grid.place(cell, AgentId(1)));
    assert!(!grid.vacate(cell, AgentId(1)));
    assert!(grid.vacate(cell, AgentId(0)));
    assert!(grid.place(cell, AgentId(1)));
    assert!(!grid.place(Position::new(3, 0), AgentId(2)));
    assert_eq!(grid.occupied_count(), 1);
}
