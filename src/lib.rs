//! Crossword grid filling as constraint satisfaction. Each word slot in the grid is a
//! variable whose domain is the set of dictionary words that could still go there; slots
//! that share a cell constrain each other to agree on the shared letter. Filling proceeds
//! in three stages:
//!
//! - Node consistency removes every candidate whose length doesn't match its slot.
//!
//! - AC-3 propagation removes every candidate that has no compatible candidate in some
//!   crossing slot, repeating until no more removals are possible.
//!
//! - Backtracking search assigns a word to one slot at a time, choosing slots by
//!   minimum-remaining-values (degree as tiebreak) and ordering words by how few options
//!   they rule out for crossing slots.
//!
//! An unsatisfiable grid is an ordinary outcome, reported as a value rather than an error.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;

use bit_set::BitSet;
use instant::{Duration, Instant};
use log::debug;
use smallvec::SmallVec;

/// The expected maximum length for a single slot.
pub const MAX_SLOT_LENGTH: usize = 21;

/// An identifier for a slot, based on its index in the grid's `variables` field.
pub type SlotId = usize;

/// An identifier for a word, based on its index in the solver's deduplicated word list.
pub type WordId = usize;

/// Direction that a slot is facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Across,
    Down,
}

/// A single word slot: starting cell, length, and direction. Two variables are equal iff
/// all four attributes match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variable {
    pub row: usize,
    pub col: usize,
    pub length: usize,
    pub direction: Direction,
}

impl Variable {
    /// Generate the (row, col) coords for each cell of this slot, in word order.
    pub fn cells(self) -> impl Iterator<Item = (usize, usize)> {
        (0..self.length).map(move |k| match self.direction {
            Direction::Across => (self.row, self.col + k),
            Direction::Down => (self.row + k, self.col),
        })
    }
}

/// A crossing between one slot and another, referencing the other slot's id and the
/// location of the shared cell within the other slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub other_slot_id: SlotId,
    pub other_slot_cell: usize,
}

/// Errors reported while turning a template string into a [`Grid`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GridError {
    #[error("template contains no rows")]
    EmptyTemplate,
    #[error("template rows have inconsistent widths")]
    RaggedTemplate,
    #[error("unsupported template cell {cell:?} (expected '.' or '#')")]
    UnsupportedCell { cell: char },
    #[error("template contains no slots of length 2 or more")]
    NoSlots,
}

/// The static description of a puzzle: cell occupancy, the derived word slots, and the
/// crossing geometry between them. Built once from a template string, read-only
/// thereafter.
pub struct Grid {
    pub width: usize,
    pub height: usize,
    /// Row-major occupancy; true means a letter cell, false means a block.
    open: Vec<bool>,
    pub variables: Vec<Variable>,
    /// For each slot, one entry per cell: the crossing slot sharing that cell, if any.
    /// `crossings[x][i] == Some(Crossing { y, j })` means letter i of slot x must equal
    /// letter j of slot y.
    crossings: Vec<SmallVec<[Option<Crossing>; MAX_SLOT_LENGTH]>>,
}

impl Grid {
    /// Build a grid from a string template, with `.` representing open cells and `#`
    /// representing blocks. Blank lines and surrounding whitespace are ignored. Slots are
    /// maximal runs of at least two open cells.
    pub fn from_template_string(template: &str) -> Result<Grid, GridError> {
        let rows: Vec<Vec<char>> = template
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    None
                } else {
                    Some(line.chars().collect())
                }
            })
            .collect();

        if rows.is_empty() {
            return Err(GridError::EmptyTemplate);
        }
        let width = rows[0].len();
        let height = rows.len();
        if rows.iter().any(|row| row.len() != width) {
            return Err(GridError::RaggedTemplate);
        }

        let mut open = vec![false; width * height];
        for (row_idx, row) in rows.iter().enumerate() {
            for (col_idx, &cell) in row.iter().enumerate() {
                match cell {
                    '.' => open[row_idx * width + col_idx] = true,
                    '#' => {}
                    cell => return Err(GridError::UnsupportedCell { cell }),
                }
            }
        }

        let mut variables: Vec<Variable> = vec![];

        // Across slots: maximal horizontal runs of open cells.
        for row in 0..height {
            let mut run_start = 0;
            for col in 0..=width {
                if col < width && open[row * width + col] {
                    continue;
                }
                if col - run_start > 1 {
                    variables.push(Variable {
                        row,
                        col: run_start,
                        length: col - run_start,
                        direction: Direction::Across,
                    });
                }
                run_start = col + 1;
            }
        }

        // Down slots: the same thing vertically.
        for col in 0..width {
            let mut run_start = 0;
            for row in 0..=height {
                if row < height && open[row * width + col] {
                    continue;
                }
                if row - run_start > 1 {
                    variables.push(Variable {
                        row: run_start,
                        col,
                        length: row - run_start,
                        direction: Direction::Down,
                    });
                }
                run_start = row + 1;
            }
        }

        if variables.is_empty() {
            return Err(GridError::NoSlots);
        }

        // Build a map from cell location to the slots through it, then derive crossings.
        // A cell hosts at most one across and one down slot, so any pair of slots shares
        // at most one cell.
        let mut slots_by_cell: HashMap<(usize, usize), Vec<(SlotId, usize)>> = HashMap::new();
        for (slot_id, variable) in variables.iter().enumerate() {
            for (cell_idx, cell) in variable.cells().enumerate() {
                slots_by_cell.entry(cell).or_default().push((slot_id, cell_idx));
            }
        }

        let crossings = variables
            .iter()
            .enumerate()
            .map(|(slot_id, variable)| {
                variable
                    .cells()
                    .map(|cell| {
                        slots_by_cell[&cell]
                            .iter()
                            .find(|&&(other, _)| other != slot_id)
                            .map(|&(other_slot_id, other_slot_cell)| Crossing {
                                other_slot_id,
                                other_slot_cell,
                            })
                    })
                    .collect()
            })
            .collect();

        Ok(Grid {
            width,
            height,
            open,
            variables,
            crossings,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.variables.len()
    }

    pub fn is_open(&self, row: usize, col: usize) -> bool {
        self.open[row * self.width + col]
    }

    /// The per-cell crossing table for a slot.
    pub fn crossings(&self, slot_id: SlotId) -> &[Option<Crossing>] {
        &self.crossings[slot_id]
    }

    /// If slots `x` and `y` share a cell, the pair of letter indices (i, j) such that
    /// letter i of `x` must equal letter j of `y`.
    pub fn overlap(&self, x: SlotId, y: SlotId) -> Option<(usize, usize)> {
        self.crossings[x]
            .iter()
            .enumerate()
            .find_map(|(cell_idx, crossing)| match crossing {
                Some(crossing) if crossing.other_slot_id == y => {
                    Some((cell_idx, crossing.other_slot_cell))
                }
                _ => None,
            })
    }

    /// All slots sharing a cell with `x`. Each neighbor appears exactly once because any
    /// pair of slots shares at most one cell.
    pub fn neighbors(&self, x: SlotId) -> impl Iterator<Item = SlotId> + '_ {
        self.crossings[x]
            .iter()
            .filter_map(|crossing| crossing.as_ref().map(|crossing| crossing.other_slot_id))
    }

    /// The number of slots crossing `x`.
    pub fn degree(&self, x: SlotId) -> usize {
        self.crossings[x].iter().filter(|crossing| crossing.is_some()).count()
    }
}

/// A dictionary word that can be chosen for a slot.
#[derive(Debug)]
struct Word {
    text: String,
    letters: SmallVec<[char; MAX_SLOT_LENGTH]>,
}

impl Word {
    fn new(text: &str) -> Word {
        Word {
            letters: text.chars().collect(),
            text: text.to_string(),
        }
    }

    fn len(&self) -> usize {
        self.letters.len()
    }

    fn letter(&self, idx: usize) -> char {
        self.letters[idx]
    }
}

/// Counters tracking the filling process.
#[derive(Debug, Clone)]
pub struct Statistics {
    /// Search-tree nodes visited.
    pub states: u64,
    /// Nodes whose candidates were all exhausted, forcing a return to the parent.
    pub backtracks: u64,
    pub duration: Duration,
}

/// A mapping from slot to chosen word. Results returned by the solver are complete;
/// partially filled values are accepted by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Indexed by `SlotId`, parallel to `Grid::variables`.
    pub words: Vec<Option<String>>,
}

impl Assignment {
    pub fn word(&self, slot_id: SlotId) -> Option<&str> {
        self.words[slot_id].as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.words.iter().all(Option::is_some)
    }
}

/// The result of a successful fill.
#[derive(Debug)]
pub struct FillSuccess {
    pub statistics: Statistics,
    pub assignment: Assignment,
}

/// Why a fill produced no assignment. Both cases are ordinary outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillFailure {
    /// Propagation emptied a domain, or the search exhausted every branch.
    Unsatisfiable,
    /// The configured time limit expired before the search finished.
    TimedOut,
}

/// The filling engine: holds the grid, the deduplicated word list, and the live domain
/// store. Domains shrink monotonically during the consistency phases and are read-only
/// during search, so every search branch shares the same store and backtracking only has
/// to undo its own tentative assignment.
pub struct Solver<'g> {
    grid: &'g Grid,
    words: Vec<Word>,
    /// Candidate word ids for each slot, indexed by `SlotId`.
    domains: Vec<Vec<WordId>>,
    deadline: Option<Instant>,
    timed_out: bool,
    statistics: Statistics,
}

impl<'g> Solver<'g> {
    /// Create a solver where every slot's domain is the full (deduplicated) word list.
    pub fn new(grid: &'g Grid, word_list: &[String]) -> Solver<'g> {
        let mut words: Vec<Word> = Vec::with_capacity(word_list.len());
        let mut seen: HashSet<&str> = HashSet::with_capacity(word_list.len());
        for text in word_list {
            if seen.insert(text.as_str()) {
                words.push(Word::new(text));
            }
        }

        let full_domain: Vec<WordId> = (0..words.len()).collect();
        let domains = (0..grid.slot_count()).map(|_| full_domain.clone()).collect();

        Solver {
            grid,
            words,
            domains,
            deadline: None,
            timed_out: false,
            statistics: Statistics {
                states: 0,
                backtracks: 0,
                duration: Duration::from_millis(0),
            },
        }
    }

    /// Give up and report [`FillFailure::TimedOut`] once this much wall-clock time has
    /// passed. The deadline is polled at each search-tree node, so expiry is cooperative
    /// rather than immediate.
    pub fn with_time_limit(mut self, limit: Duration) -> Solver<'g> {
        self.deadline = Some(Instant::now() + limit);
        self
    }

    pub fn word(&self, word_id: WordId) -> &str {
        &self.words[word_id].text
    }

    pub fn domain(&self, slot_id: SlotId) -> &[WordId] {
        &self.domains[slot_id]
    }

    /// Remove every candidate whose length doesn't match its slot. A domain emptied here
    /// is not an error; it surfaces as a propagation failure instead.
    pub fn enforce_node_consistency(&mut self) {
        let words = &self.words;
        for (slot_id, variable) in self.grid.variables.iter().enumerate() {
            self.domains[slot_id].retain(|&word_id| words[word_id].len() == variable.length);
        }
    }

    /// Make `x` arc-consistent with `y` by removing candidates of `x` that agree with no
    /// remaining candidate of `y` at the shared cell. Returns whether anything was
    /// removed. The slots must cross.
    fn revise(&mut self, x: SlotId, y: SlotId) -> bool {
        let (x_cell, y_cell) = self
            .grid
            .overlap(x, y)
            .expect("revise requires slots that cross");

        let mut domain_x = mem::take(&mut self.domains[x]);
        let len_before = domain_x.len();

        let words = &self.words;
        let domain_y = &self.domains[y];
        domain_x.retain(|&x_word| {
            domain_y
                .iter()
                .any(|&y_word| words[x_word].letter(x_cell) == words[y_word].letter(y_cell))
        });

        let revised = domain_x.len() != len_before;
        self.domains[x] = domain_x;
        revised
    }

    /// AC-3: repeatedly revise arcs until every domain is arc-consistent with all of its
    /// crossing slots. If `arcs` is `None`, start from every (slot, neighbor) pair;
    /// otherwise start from the given arcs only. Returns false as soon as any domain is
    /// empty, which means the puzzle is unsatisfiable without ever searching.
    pub fn propagate(&mut self, arcs: Option<Vec<(SlotId, SlotId)>>) -> bool {
        let slot_count = self.grid.slot_count();

        // An already-empty domain is a wipeout; don't wait for a revision to notice it.
        if let Some(slot_id) = (0..slot_count).find(|&slot_id| self.domains[slot_id].is_empty()) {
            debug!("slot {slot_id} has an empty domain before propagation");
            return false;
        }

        let mut queue: VecDeque<(SlotId, SlotId)> = match arcs {
            Some(arcs) => arcs.into_iter().collect(),
            None => (0..slot_count)
                .flat_map(|x| self.grid.neighbors(x).map(move |y| (x, y)))
                .collect(),
        };

        // Arc ids keyed x * slot_count + y, so re-enqueueing an arc that is already
        // pending is a no-op.
        let mut pending = BitSet::with_capacity(slot_count * slot_count);
        for &(x, y) in &queue {
            pending.insert(x * slot_count + y);
        }

        while let Some((x, y)) = queue.pop_front() {
            pending.remove(x * slot_count + y);

            if !self.revise(x, y) {
                continue;
            }
            if self.domains[x].is_empty() {
                debug!("revising slot {x} against slot {y} emptied its domain");
                return false;
            }

            // Tightening x may invalidate support that x's other neighbors relied on.
            for z in self.grid.neighbors(x) {
                if z != y && pending.insert(z * slot_count + x) {
                    queue.push_back((z, x));
                }
            }
        }

        true
    }

    /// Minimum-remaining-values variable selection: among unassigned slots, the one with
    /// the smallest domain, preferring the most crossings on ties. Remaining ties are
    /// broken arbitrarily.
    pub fn select_unassigned_variable(&self, assignment: &[Option<WordId>]) -> Option<SlotId> {
        (0..self.grid.slot_count())
            .filter(|&slot_id| assignment[slot_id].is_none())
            .min_by_key(|&slot_id| {
                (self.domains[slot_id].len(), Reverse(self.grid.degree(slot_id)))
            })
    }

    /// Least-constraining-value ordering: the slot's domain sorted ascending by the
    /// number of unassigned crossing slots whose domains contain the same word. Word ids
    /// are deduplicated, so id equality is string equality. This only affects search
    /// order, never correctness.
    pub fn order_domain_values(
        &self,
        slot_id: SlotId,
        assignment: &[Option<WordId>],
    ) -> Vec<WordId> {
        let unassigned_neighbors: Vec<SlotId> = self
            .grid
            .neighbors(slot_id)
            .filter(|&neighbor| assignment[neighbor].is_none())
            .collect();

        let mut ordered = self.domains[slot_id].clone();
        ordered.sort_by_cached_key(|&word_id| {
            unassigned_neighbors
                .iter()
                .filter(|&&neighbor| self.domains[neighbor].contains(&word_id))
                .count()
        });
        ordered
    }

    /// Check a partial or complete assignment against the three assignment invariants:
    /// every word's length matches its slot, no word is used twice, and every pair of
    /// assigned crossing slots agrees on the shared letter.
    pub fn is_consistent(&self, assignment: &[Option<WordId>]) -> bool {
        let mut used_words = BitSet::with_capacity(self.words.len());

        for (slot_id, variable) in self.grid.variables.iter().enumerate() {
            let Some(word_id) = assignment[slot_id] else {
                continue;
            };
            if self.words[word_id].len() != variable.length {
                return false;
            }
            if !used_words.insert(word_id) {
                return false;
            }
            for (cell_idx, crossing) in self.grid.crossings(slot_id).iter().enumerate() {
                let Some(crossing) = crossing else { continue };
                let Some(other_word_id) = assignment[crossing.other_slot_id] else {
                    continue;
                };
                // `get` rather than direct indexing: the other word may be too short for
                // its own slot, which its length check will report.
                if self.words[word_id].letters.get(cell_idx)
                    != self.words[other_word_id].letters.get(crossing.other_slot_cell)
                {
                    return false;
                }
            }
        }

        true
    }

    /// Incremental form of [`Solver::is_consistent`] for a single tentative extension:
    /// assuming `assignment` is already consistent, would assigning `word_id` to
    /// `slot_id` keep it that way?
    fn value_is_consistent(
        &self,
        slot_id: SlotId,
        word_id: WordId,
        assignment: &[Option<WordId>],
        used_words: &BitSet,
    ) -> bool {
        if self.words[word_id].len() != self.grid.variables[slot_id].length {
            return false;
        }
        if used_words.contains(word_id) {
            return false;
        }
        self.grid
            .crossings(slot_id)
            .iter()
            .enumerate()
            .all(|(cell_idx, crossing)| match crossing {
                Some(crossing) => match assignment[crossing.other_slot_id] {
                    Some(other_word_id) => {
                        self.words[word_id].letter(cell_idx)
                            == self.words[other_word_id].letter(crossing.other_slot_cell)
                    }
                    None => true,
                },
                None => true,
            })
    }

    /// Depth-first backtracking search from the given partial assignment, extending it in
    /// place. Returns true once every slot is assigned; on failure the assignment is
    /// restored to its initial state. Recursion depth is bounded by the slot count.
    ///
    /// Calling this with an assignment that already violates an invariant is a
    /// collaborator bug, not an unsatisfiable puzzle, and panics.
    pub fn backtrack(&mut self, assignment: &mut Vec<Option<WordId>>) -> bool {
        assert_eq!(
            assignment.len(),
            self.grid.slot_count(),
            "assignment must have one entry per slot"
        );
        assert!(
            self.is_consistent(assignment),
            "initial assignment violates an assignment invariant"
        );

        let mut used_words = BitSet::with_capacity(self.words.len());
        for &word_id in assignment.iter().flatten() {
            used_words.insert(word_id);
        }

        self.search(assignment, &mut used_words)
    }

    fn search(&mut self, assignment: &mut Vec<Option<WordId>>, used_words: &mut BitSet) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.timed_out = true;
                return false;
            }
        }

        let Some(slot_id) = self.select_unassigned_variable(assignment) else {
            return true; // Every slot is assigned.
        };
        self.statistics.states += 1;

        for word_id in self.order_domain_values(slot_id, assignment) {
            if !self.value_is_consistent(slot_id, word_id, assignment, used_words) {
                continue;
            }

            assignment[slot_id] = Some(word_id);
            used_words.insert(word_id);

            if self.search(assignment, used_words) {
                return true;
            }

            assignment[slot_id] = None;
            used_words.remove(word_id);

            if self.timed_out {
                return false;
            }
        }

        self.statistics.backtracks += 1;
        false
    }

    /// Run the whole pipeline: node consistency, AC-3, then backtracking search.
    pub fn fill(mut self) -> Result<FillSuccess, FillFailure> {
        let start = Instant::now();

        self.enforce_node_consistency();
        if !self.propagate(None) {
            return Err(FillFailure::Unsatisfiable);
        }
        debug!(
            "domains after propagation: {:?}",
            self.domains.iter().map(Vec::len).collect::<Vec<_>>()
        );

        let mut assignment: Vec<Option<WordId>> = vec![None; self.grid.slot_count()];
        let solved = self.backtrack(&mut assignment);
        self.statistics.duration = start.elapsed();

        if !solved {
            return Err(if self.timed_out {
                FillFailure::TimedOut
            } else {
                FillFailure::Unsatisfiable
            });
        }

        debug_assert!(self.is_consistent(&assignment));
        let words = assignment
            .iter()
            .map(|choice| choice.map(|word_id| self.words[word_id].text.clone()))
            .collect();

        Ok(FillSuccess {
            statistics: self.statistics,
            assignment: Assignment { words },
        })
    }
}

/// Fill the grid from the given word list, or report that no fill exists.
pub fn solve(grid: &Grid, word_list: &[String]) -> Option<Assignment> {
    match Solver::new(grid, word_list).fill() {
        Ok(FillSuccess { assignment, .. }) => Some(assignment),
        Err(_) => None,
    }
}

/// Turn the given grid and assignment into a rendered string: blocks as `█`, open but
/// unfilled cells as spaces, filled cells as the assigned letter.
pub fn render_grid(grid: &Grid, assignment: &Assignment) -> String {
    let mut letters: Vec<Option<char>> = vec![None; grid.width * grid.height];
    for (slot_id, variable) in grid.variables.iter().enumerate() {
        let Some(word) = assignment.word(slot_id) else {
            continue;
        };
        for (letter, (row, col)) in word.chars().zip(variable.cells()) {
            letters[row * grid.width + col] = Some(letter);
        }
    }

    let rows: Vec<String> = (0..grid.height)
        .map(|row| {
            (0..grid.width)
                .map(|col| {
                    if grid.is_open(row, col) {
                        letters[row * grid.width + col].unwrap_or(' ')
                    } else {
                        '█'
                    }
                })
                .collect()
        })
        .collect();
    rows.join("\n")
}
