//! Integer allocation
//!
//! Real-valued expected counts become integers in two steps: a per-row
//! largest-remainder rounding that hits each row total exactly, then
//! corrective passes that move single units between categories of the same
//! row to reduce the error against a margin. Moves never change a row total.

/// Largest-remainder (Hamilton) rounding of `values` to integers summing to
/// exactly `total`.
///
/// Values are rescaled to `total` first. When every value is zero the total
/// is spread evenly. Ties go to the larger value, then the lower index.
pub fn largest_remainder(values: &[f64], total: u64) -> Vec<u64> {
    if values.is_empty() {
        return Vec::new();
    }
    let sum: f64 = values.iter().filter(|v| v.is_finite() && **v > 0.0).sum();
    let quotas: Vec<f64> = if sum > 0.0 {
        values
            .iter()
            .map(|&v| if v.is_finite() && v > 0.0 { v * total as f64 / sum } else { 0.0 })
            .collect()
    } else {
        vec![total as f64 / values.len() as f64; values.len()]
    };

    let mut counts: Vec<u64> = quotas.iter().map(|q| q.floor() as u64).collect();
    let allocated: u64 = counts.iter().sum();

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.total_cmp(&fa)
            .then(quotas[b].total_cmp(&quotas[a]))
            .then(a.cmp(&b))
    });

    if allocated <= total {
        for &i in order.iter().cycle().take((total - allocated) as usize) {
            counts[i] += 1;
        }
    } else {
        // Only reachable through floating point noise on huge totals
        let mut excess = allocated - total;
        for &i in order.iter().rev() {
            if excess == 0 {
                break;
            }
            let take = counts[i].min(excess);
            counts[i] -= take;
            excess -= take;
        }
    }
    counts
}

/// Map from allocation cells to the cells of one margin, with integer targets.
#[derive(Debug, Clone)]
pub struct MarginTarget {
    /// `cell_of[row][col]` is the margin cell that (row, col) contributes to
    pub cell_of: Vec<Vec<usize>>,
    pub targets: Vec<u64>,
}

impl MarginTarget {
    pub fn realized(&self, counts: &[Vec<u64>]) -> Vec<u64> {
        let mut realized = vec![0u64; self.targets.len()];
        for (row, cells) in counts.iter().zip(&self.cell_of) {
            for (&count, &m) in row.iter().zip(cells) {
                realized[m] += count;
            }
        }
        realized
    }

    /// Sum of absolute differences between realized and target counts.
    pub fn abs_error(&self, counts: &[Vec<u64>]) -> u64 {
        self.realized(counts)
            .iter()
            .zip(&self.targets)
            .map(|(&r, &t)| r.abs_diff(t))
            .sum()
    }
}

/// Move units within rows until no single move reduces the margin error.
///
/// A move takes one unit of `row` from a column whose margin cell is over
/// target to a column whose margin cell is under target. Columns with zero
/// expected mass are never filled. Among valid moves, the one that best
/// restores `expected` is taken first. Returns the number of moves made.
pub fn correct_towards(
    counts: &mut [Vec<u64>],
    expected: &[Vec<f64>],
    margin: &MarginTarget,
    max_moves: usize,
) -> usize {
    let realized = margin.realized(counts);
    let mut error: Vec<i64> = realized
        .iter()
        .zip(&margin.targets)
        .map(|(&r, &t)| r as i64 - t as i64)
        .collect();

    let mut moves = 0;
    while moves < max_moves {
        let mut best: Option<(usize, usize, usize, f64)> = None;
        for (row, cells) in margin.cell_of.iter().enumerate() {
            for from in 0..cells.len() {
                if counts[row][from] == 0 || error[cells[from]] <= 0 {
                    continue;
                }
                let give = expected[row][from] - counts[row][from] as f64;
                for to in 0..cells.len() {
                    if to == from || expected[row][to] <= 0.0 || error[cells[to]] >= 0 {
                        continue;
                    }
                    let take = expected[row][to] - counts[row][to] as f64;
                    let gain = take - give;
                    if best.map_or(true, |(_, _, _, g)| gain > g) {
                        best = Some((row, from, to, gain));
                    }
                }
            }
        }

        let Some((row, from, to, _)) = best else {
            break;
        };
        counts[row][from] -= 1;
        counts[row][to] += 1;
        error[margin.cell_of[row][from]] -= 1;
        error[margin.cell_of[row][to]] += 1;
        moves += 1;
    }
    moves
}
