//! Hedge arithmetic: target allocation, compensation and order pricing.
//!
//! Pure functions so the coordinator's decisions can be tested without
//! venues or timers.

use crate::exchange::{Side, TopOfBook};
use crate::strategy::monitor::Direction;
use crate::utils::decimal::{round_down_to_lot, round_down_to_tick, round_to_lot, round_up_to_tick};
use rust_decimal::Decimal;

/// Signed entry targets per leg.
///
/// The sell leg of `direction` goes short `quantity`. With two legs the other
/// leg goes long `quantity`; with three the third leg takes half (rounded
/// down to its lot) and the direction's buy leg the remainder.
pub fn allocate_targets(direction: Direction, quantity: Decimal, lots: &[Decimal]) -> Vec<Decimal> {
    let mut targets = vec![Decimal::ZERO; lots.len()];
    targets[direction.sell] = -quantity;

    match lots.len() {
        3 => {
            let third = (0..3)
                .find(|i| *i != direction.sell && *i != direction.buy)
                .unwrap_or(direction.buy);
            let half = round_down_to_lot(quantity / Decimal::TWO, lots[third]);
            targets[third] = half;
            targets[direction.buy] = quantity - half;
        }
        _ => targets[direction.buy] = quantity,
    }
    targets
}

/// New goals for the legs lagging behind the other side of the hedge.
///
/// Legs with a positive target form the long side, the rest the short side.
/// While entering the side holding less must grow to the other's size; while
/// exiting the side holding more must shrink to it. The difference is split
/// across the lagging legs that are short of their proportional share (by
/// entry target), so no leg is ever moved against the phase.
pub fn compensation_goals(
    entering: bool,
    positions: &[Decimal],
    targets: &[Decimal],
    lots: &[Decimal],
) -> Vec<(usize, Decimal)> {
    let long: Vec<usize> = (0..targets.len()).filter(|i| targets[*i] > Decimal::ZERO).collect();
    let short: Vec<usize> = (0..targets.len()).filter(|i| targets[*i] < Decimal::ZERO).collect();

    let held_long: Decimal = long.iter().map(|i| positions[*i]).sum();
    let held_short: Decimal = short.iter().map(|i| -positions[*i]).sum();
    if held_long == held_short {
        return Vec::new();
    }

    let match_to = if entering {
        held_long.max(held_short)
    } else {
        held_long.min(held_short)
    };
    let (lagging, sign, held) = if held_long != match_to {
        (long, Decimal::ONE, held_long)
    } else {
        (short, Decimal::NEGATIVE_ONE, held_short)
    };
    // Entering grows the lagging side, exiting shrinks it
    let step = if entering { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
    let amount = (match_to - held).abs();

    let weight_total: Decimal = lagging.iter().map(|i| targets[*i].abs()).sum();
    if weight_total == Decimal::ZERO {
        return Vec::new();
    }

    // How far each leg is from its share, in the direction of the phase
    let rooms: Vec<(usize, Decimal, Decimal)> = lagging
        .iter()
        .map(|&i| {
            let current = sign * positions[i];
            let share = match_to * targets[i].abs() / weight_total;
            (i, current, ((share - current) * step).max(Decimal::ZERO))
        })
        .filter(|(_, _, room)| *room > Decimal::ZERO)
        .collect();
    let room_total: Decimal = rooms.iter().map(|(_, _, room)| *room).sum();
    if room_total == Decimal::ZERO {
        return Vec::new();
    }

    let mut assigned = Decimal::ZERO;
    let mut goals = Vec::with_capacity(rooms.len());
    for (k, &(i, current, room)) in rooms.iter().enumerate() {
        let wanted = if k + 1 == rooms.len() {
            amount - assigned
        } else {
            amount * room / room_total
        };
        let limit = if entering {
            targets[i].abs() - current
        } else {
            current
        };
        let moved = round_to_lot(wanted, lots[i]).min(limit).max(Decimal::ZERO);
        if moved == Decimal::ZERO {
            continue;
        }
        assigned += moved;
        goals.push((i, sign * (current + step * moved)));
    }
    goals
}

/// Passive limit price inside the spread.
///
/// Buys sit `ratio` of the spread above the bid, sells `ratio` below the ask,
/// rounded away from the opposite touch.
pub fn maker_price(book: &TopOfBook, side: Side, ratio: Decimal, tick: Decimal) -> Decimal {
    let width = (book.ask - book.bid).max(Decimal::ZERO);
    match side {
        Side::Buy => round_down_to_tick(book.bid + width * ratio, tick),
        Side::Sell => round_up_to_tick(book.ask - width * ratio, tick),
    }
}

/// Next price of a chasing order.
///
/// Starts at the own-side touch and moves `step` toward the opposite touch
/// each call, never crossing it and never falling behind the own side.
pub fn chase_price(previous: Option<Decimal>, book: &TopOfBook, side: Side, step: Decimal) -> Decimal {
    let own = book.same_side(side);
    let far = book.touch(side);
    match (previous, side) {
        (None, _) => own,
        (Some(p), Side::Buy) => (p + step).max(own).min(far),
        (Some(p), Side::Sell) => (p - step).min(own).max(far),
    }
}

/// Signed notional exposure of a set of positions at `price`.
pub fn net_exposure(positions: &[Decimal], price: Decimal) -> Decimal {
    positions.iter().copied().sum::<Decimal>() * price
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn dir(sell: usize, buy: usize) -> Direction {
        Direction { sell, buy }
    }

    #[test]
    fn test_two_leg_allocation() {
        let targets = allocate_targets(dir(0, 1), dec!(0.01), &[dec!(0.001), dec!(0.001)]);
        assert_eq!(targets, vec![dec!(-0.01), dec!(0.01)]);
    }

    #[test]
    fn test_three_leg_allocation() {
        let lots = [dec!(0.001), dec!(0.001), dec!(0.001)];
        let targets = allocate_targets(dir(0, 1), dec!(0.011), &lots);
        assert_eq!(targets, vec![dec!(-0.011), dec!(0.006), dec!(0.005)]);
        assert_eq!(targets.iter().copied().sum::<Decimal>(), Decimal::ZERO);

        let targets = allocate_targets(dir(2, 0), dec!(0.01), &lots);
        assert_eq!(targets, vec![dec!(0.005), dec!(0.005), dec!(-0.01)]);
    }

    #[test]
    fn test_maker_prices_do_not_cross() {
        let book = TopOfBook::new(dec!(50010), dec!(50012));
        assert_eq!(maker_price(&book, Side::Sell, dec!(0.3), dec!(0.1)), dec!(50011.4));
        assert_eq!(maker_price(&book, Side::Buy, dec!(0.3), dec!(0.1)), dec!(50010.6));

        let tight = TopOfBook::new(dec!(100.0), dec!(100.1));
        assert_eq!(maker_price(&tight, Side::Buy, dec!(0.3), dec!(0.1)), dec!(100.0));
        assert_eq!(maker_price(&tight, Side::Sell, dec!(0.3), dec!(0.1)), dec!(100.1));
    }

    #[test]
    fn test_chase_steps_toward_far_touch() {
        let book = TopOfBook::new(dec!(50005), dec!(50005.3));
        let step = dec!(0.1);
        let p0 = chase_price(None, &book, Side::Buy, step);
        assert_eq!(p0, dec!(50005));
        let p1 = chase_price(Some(p0), &book, Side::Buy, step);
        assert_eq!(p1, dec!(50005.1));
        let capped = chase_price(Some(dec!(50005.3)), &book, Side::Buy, step);
        assert_eq!(capped, dec!(50005.3));

        let s = chase_price(Some(dec!(50005.2)), &book, Side::Sell, step);
        assert_eq!(s, dec!(50005.1));
        // Market moved up past the working price: restart from the own side
        let moved = chase_price(Some(dec!(50004)), &book, Side::Buy, step);
        assert_eq!(moved, dec!(50005));
    }

    /// Lagging legs fill exactly to their compensation goals after every
    /// leading fill; at the end nothing is left unhedged.
    fn run_entry(targets: &[Decimal], lots: &[Decimal], leading_fills: &[(usize, Decimal)]) -> Vec<Decimal> {
        let mut positions = vec![Decimal::ZERO; targets.len()];
        for (leg, qty) in leading_fills {
            positions[*leg] += *qty;
            for (i, goal) in compensation_goals(true, &positions, targets, lots) {
                positions[i] = goal;
            }
        }
        positions
    }

    #[test]
    fn test_no_unhedged_residue_two_legs() {
        let targets = [dec!(-0.01), dec!(0.01)];
        let lots = [dec!(0.001), dec!(0.001)];
        let fills = [(0, dec!(-0.003)), (0, dec!(-0.004)), (0, dec!(-0.003))];

        let positions = run_entry(&targets, &lots, &fills);
        assert_eq!(positions, targets.to_vec());
        assert_eq!(net_exposure(&positions, dec!(50000)), Decimal::ZERO);
    }

    #[test]
    fn test_no_unhedged_residue_three_legs() {
        let targets = [dec!(-0.01), dec!(0.005), dec!(0.005)];
        let lots = [dec!(0.001), dec!(0.001), dec!(0.001)];
        // Sell leg fills in pieces, then one buy leg overshoots the other
        let fills = [(0, dec!(-0.003)), (0, dec!(-0.005)), (1, dec!(0.001)), (0, dec!(-0.001))];

        let positions = run_entry(&targets, &lots, &fills);
        assert_eq!(positions.iter().copied().sum::<Decimal>(), Decimal::ZERO);
        assert_eq!(positions[0], dec!(-0.01));
    }

    #[test]
    fn test_exit_compensation_shrinks_larger_side() {
        let targets = [dec!(-0.01), dec!(0.005), dec!(0.005)];
        let lots = [dec!(0.001), dec!(0.001), dec!(0.001)];
        // Short leg already bought back 0.004 of its 0.01
        let positions = [dec!(-0.006), dec!(0.005), dec!(0.005)];

        let goals = compensation_goals(false, &positions, &targets, &lots);
        assert_eq!(goals, vec![(1, dec!(0.003)), (2, dec!(0.003))]);

        let mut after = positions.to_vec();
        for (i, g) in goals {
            after[i] = g;
        }
        assert_eq!(after.iter().copied().sum::<Decimal>(), Decimal::ZERO);
    }

    #[test]
    fn test_compensation_never_reverses_a_leg() {
        let targets = [dec!(-0.01), dec!(0.005), dec!(0.005)];
        let lots = [dec!(0.001), dec!(0.001), dec!(0.001)];
        // Leg 1 is already ahead of its share of the 0.004 short
        let positions = [dec!(-0.004), dec!(0.003), Decimal::ZERO];

        let goals = compensation_goals(true, &positions, &targets, &lots);
        assert_eq!(goals, vec![(2, dec!(0.001))]);

        // Exiting: leg 2 already bought back below its share
        let positions = [dec!(-0.004), dec!(0.005), dec!(0.001)];
        let goals = compensation_goals(false, &positions, &targets, &lots);
        assert_eq!(goals, vec![(1, dec!(0.003))]);
    }

    #[test]
    fn test_balanced_positions_need_no_compensation() {
        let targets = [dec!(-0.01), dec!(0.01)];
        let lots = [dec!(0.001), dec!(0.001)];
        assert!(compensation_goals(true, &[dec!(-0.004), dec!(0.004)], &targets, &lots).is_empty());
    }
}
