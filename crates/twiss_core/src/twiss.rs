//! Mode-dispatch orchestrator.
//!
//! The entry points validate the requested option combination, resolve the
//! boundary condition (periodic solve, preserved boundary, or caller
//! supplied), run the open-line propagation, and attach global, chromatic
//! and radiation quantities. The orchestration is a fixed pipeline of
//! stages; every tracking call receives an explicit [`TrackConfig`] so no
//! collaborator state is ever toggled in place.

use nalgebra::{Matrix2, Matrix6, Vector2};
use num_traits::Float;

use crate::bundle::FiniteDiffSteps;
use crate::closed_orbit::{find_closed_orbit, CoSearchSettings};
use crate::error::{Result, TwissError};
use crate::normal_form::{
    compute_normal_form, plane_eigenvalues, DEFAULT_RESPONSIVENESS_TOL, DEFAULT_STABILITY_TOL,
};
use crate::propagate::{
    compute_lattice_functions, eigen_scale, propagate_optics, DEFAULT_DELTA_DISP, DEFAULT_NEMITT,
    DEFAULT_R_SIGMA,
};
use crate::state::{PhaseSpaceState, C_LIGHT};
use crate::table::{
    RadiationQuantities, ReferenceFrame, TwissInit, TwissMethod, TwissTable,
};
use crate::tracker::{ElementRange, RadiationMode, Splicable, TrackConfig, Tracker};
use crate::transfer_matrix::one_turn_matrix;

/// Default momentum offset for the chromaticity finite difference.
pub const DEFAULT_DELTA_CHROM: f64 = 5e-5;

/// How the boundary condition of the computation is obtained.
#[derive(Debug, Clone)]
pub enum InitSpec {
    /// Solve the periodic problem on the requested range.
    Periodic,
    /// Solve the full line periodically, then seed the open computation
    /// with the boundary extracted at the range start.
    PreserveStart,
    /// As [`InitSpec::PreserveStart`], anchored at the range end.
    PreserveEnd,
    /// Caller-supplied boundary condition.
    Boundary(TwissInit),
}

/// Options of a twiss computation. The defaults reproduce a full-line,
/// six-dimensional periodic solve with chromatic properties.
#[derive(Debug, Clone)]
pub struct TwissOptions {
    pub method: TwissMethod,
    /// First element of the range; requires `stop` and `init`.
    pub start: Option<String>,
    /// Last element of the range, included in the result.
    pub stop: Option<String>,
    pub init: Option<InitSpec>,
    /// Compute in the counter-propagating frame; the result is expressed
    /// in the proper frame via the frame transform.
    pub reverse: bool,
    /// Pins the momentum plane of the closed-orbit search (4D default 0).
    pub delta0: Option<f64>,
    /// Pins the path-length plane of the closed-orbit search.
    pub zeta0: Option<f64>,
    pub freeze_longitudinal: bool,
    pub radiation_method: RadiationMode,
    pub nemitt_x: f64,
    pub nemitt_y: f64,
    pub r_sigma: f64,
    pub delta_disp: f64,
    pub delta_chrom: f64,
    pub compute_chromatic_properties: bool,
    pub steps_r_matrix: FiniteDiffSteps,
    pub co_search_settings: CoSearchSettings,
    pub co_guess: Option<PhaseSpaceState>,
    pub continue_on_closed_orbit_error: bool,
    pub continue_if_lost: bool,
    pub matrix_responsiveness_tol: Option<f64>,
    pub matrix_stability_tol: Option<f64>,
    pub symplectify: bool,
    /// Forest's generalized-inverse extraction; defaults to on when the
    /// line models radiation.
    pub use_full_inverse: Option<bool>,
    pub eneloss_and_damping: bool,
    pub hide_thin_groups: bool,
    /// Restrict the result to these rows, in the order given.
    pub at_elements: Option<Vec<String>>,
}

impl Default for TwissOptions {
    fn default() -> Self {
        Self {
            method: TwissMethod::SixD,
            start: None,
            stop: None,
            init: None,
            reverse: false,
            delta0: None,
            zeta0: None,
            freeze_longitudinal: false,
            radiation_method: RadiationMode::Full,
            nemitt_x: DEFAULT_NEMITT,
            nemitt_y: DEFAULT_NEMITT,
            r_sigma: DEFAULT_R_SIGMA,
            delta_disp: DEFAULT_DELTA_DISP,
            delta_chrom: DEFAULT_DELTA_CHROM,
            compute_chromatic_properties: true,
            steps_r_matrix: FiniteDiffSteps::default(),
            co_search_settings: CoSearchSettings::default(),
            co_guess: None,
            continue_on_closed_orbit_error: false,
            continue_if_lost: false,
            matrix_responsiveness_tol: Some(DEFAULT_RESPONSIVENESS_TOL),
            matrix_stability_tol: Some(DEFAULT_STABILITY_TOL),
            symplectify: false,
            use_full_inverse: None,
            eneloss_and_damping: false,
            hide_thin_groups: false,
            at_elements: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Forward,
    Backward,
}

/// Validated and index-resolved form of the options.
struct Plan {
    start_idx: usize,
    stop_excl: usize,
    sub_range: bool,
    init_spec: InitSpec,
    config: TrackConfig,
    only_4d: bool,
    responsiveness_tol: Option<f64>,
    stability_tol: Option<f64>,
    use_full_inverse: bool,
}

fn resolve_plan<T: Tracker + ?Sized>(tracker: &T, options: &TwissOptions) -> Result<Plan> {
    if options.start.is_some() != options.stop.is_some() {
        return Err(TwissError::Configuration(
            "start and stop must be provided together".into(),
        ));
    }
    if options.freeze_longitudinal && options.method == TwissMethod::SixD {
        return Err(TwissError::Configuration(
            "freeze_longitudinal requires the 4D method".into(),
        ));
    }
    if options.eneloss_and_damping && options.radiation_method == RadiationMode::KickAsClosedOrbit {
        return Err(TwissError::Configuration(
            "energy loss and damping are not available with the kick-as-closed-orbit method"
                .into(),
        ));
    }

    let find = |name: &str| -> Result<usize> {
        tracker
            .find_element(name)
            .ok_or_else(|| TwissError::Configuration(format!("no element named '{name}'")))
    };

    let sub_range = options.start.is_some();
    let (mut start_idx, mut stop_idx) = match (&options.start, &options.stop) {
        (Some(start), Some(stop)) => (find(start)?, find(stop)?),
        _ => (0, tracker.element_count().saturating_sub(1)),
    };

    let mut init_spec = match &options.init {
        None if sub_range => {
            return Err(TwissError::Configuration(
                "an initial condition must be provided when start/stop are used".into(),
            ));
        }
        None => InitSpec::Periodic,
        Some(spec) => spec.clone(),
    };

    if options.reverse {
        // The caller names the range in the reversed direction; the swap
        // restores forward indexing. A full line is already forward.
        if sub_range {
            if start_idx < stop_idx {
                return Err(TwissError::Configuration(
                    "start must not come before stop in reverse mode".into(),
                ));
            }
            std::mem::swap(&mut start_idx, &mut stop_idx);
        }
        init_spec = match init_spec {
            InitSpec::PreserveStart => InitSpec::PreserveEnd,
            InitSpec::PreserveEnd => InitSpec::PreserveStart,
            other => other,
        };
    } else if sub_range && start_idx > stop_idx {
        return Err(TwissError::Configuration(
            "start must not come after stop".into(),
        ));
    }

    match (&init_spec, options.reverse) {
        (InitSpec::Boundary(init), false) if init.reference_frame == ReferenceFrame::Reverse => {
            return Err(TwissError::Configuration(
                "the initial condition must be given in the proper frame unless reverse is set"
                    .into(),
            ));
        }
        (InitSpec::Boundary(init), true) if init.reference_frame == ReferenceFrame::Proper => {
            return Err(TwissError::Configuration(
                "the initial condition must be given in the reversed frame when reverse is set"
                    .into(),
            ));
        }
        _ => {}
    }
    if matches!(init_spec, InitSpec::PreserveStart | InitSpec::PreserveEnd) && !sub_range {
        return Err(TwissError::Configuration(
            "preserved boundary conditions require start/stop".into(),
        ));
    }

    let only_4d = options.method == TwissMethod::FourD;
    let config = TrackConfig {
        freeze_longitudinal: options.freeze_longitudinal,
        freeze_energy: only_4d,
        radiation: options.radiation_method,
    };

    // Radiation makes the one-turn matrix non-unitary; the stability band
    // does not apply and the simple parametrization breaks.
    let stability_tol = if tracker.has_radiation() {
        None
    } else {
        options.matrix_stability_tol
    };
    let use_full_inverse = options
        .use_full_inverse
        .unwrap_or_else(|| tracker.has_radiation());

    Ok(Plan {
        start_idx,
        stop_excl: stop_idx + 1,
        sub_range,
        init_spec,
        config,
        only_4d,
        responsiveness_tol: options.matrix_responsiveness_tol,
        stability_tol,
        use_full_inverse,
    })
}

fn forward_range(plan: &Plan) -> ElementRange {
    ElementRange::new(plan.start_idx, plan.stop_excl)
}

fn find_periodic_solution<T: Tracker + ?Sized>(
    tracker: &T,
    particle_ref: &PhaseSpaceState,
    options: &TwissOptions,
    plan: &Plan,
) -> Result<(TwissInit, Matrix6<f64>, crate::closed_orbit::CoSearchInfo)> {
    let delta0 = if plan.only_4d {
        Some(options.delta0.unwrap_or(0.0))
    } else {
        options.delta0
    };

    let guess = options.co_guess.unwrap_or_else(|| {
        let mut g = *particle_ref;
        g.set_coordinates([0.0; 6]);
        g
    });

    let range = forward_range(plan);
    let (orbit, info) = find_closed_orbit(
        tracker,
        &guess,
        range,
        delta0,
        options.zeta0,
        &options.co_search_settings,
        &plan.config,
        options.continue_on_closed_orbit_error,
    )?;

    let rr = one_turn_matrix(tracker, &orbit, range, &options.steps_r_matrix, &plan.config)?;
    let nf = compute_normal_form(
        &rr,
        plan.only_4d,
        options.symplectify,
        plan.responsiveness_tol,
        plan.stability_tol,
    )?;

    let init = TwissInit::new(orbit, nf.w, tracker.element_name(plan.start_idx));
    Ok((init, rr, info))
}

/// The periodic boundary condition alone, without the element-by-element
/// pass. Requires a periodic initial-condition mode.
pub fn periodic_twiss_init<T: Tracker + ?Sized>(
    tracker: &T,
    particle_ref: &PhaseSpaceState,
    options: &TwissOptions,
) -> Result<TwissInit> {
    let plan = resolve_plan(tracker, options)?;
    if !matches!(plan.init_spec, InitSpec::Periodic) {
        return Err(TwissError::Configuration(
            "a periodic boundary condition is required".into(),
        ));
    }
    let (init, _, _) = find_periodic_solution(tracker, particle_ref, options, &plan)?;
    Ok(if options.reverse { init.reverse() } else { init })
}

fn trapezoid<F: Float>(y: &[F], x: &[F]) -> F {
    let two = F::one() + F::one();
    let mut total = F::zero();
    for i in 1..y.len() {
        total = total + (y[i] + y[i - 1]) * (x[i] - x[i - 1]) / two;
    }
    total
}

fn fractional(q: f64) -> f64 {
    q - q.floor()
}

/// Open-line element-by-element solve; returns the table with the
/// column-derived scalars filled in.
fn twiss_open<T: Tracker + ?Sized>(
    tracker: &T,
    init: &TwissInit,
    plan: &Plan,
    options: &TwissOptions,
) -> Result<(TwissTable, Orientation)> {
    let prop_init = if init.reference_frame == ReferenceFrame::Reverse {
        init.reverse()
    } else {
        init.clone()
    };

    let start_name = tracker.element_name(plan.start_idx);
    let stop_name = tracker.element_name(plan.stop_excl - 1);
    let orientation = if prop_init.element_name == start_name {
        Orientation::Forward
    } else if plan.sub_range && prop_init.element_name == stop_name {
        Orientation::Backward
    } else {
        return Err(TwissError::Configuration(format!(
            "initial condition at '{}' matches neither boundary of the range",
            prop_init.element_name
        )));
    };

    let mut range = forward_range(plan);
    if orientation == Orientation::Backward {
        range = range.backtracking();
    }

    let scale = eigen_scale(
        &prop_init.orbit,
        options.nemitt_x,
        options.nemitt_y,
        options.r_sigma,
        options.delta_disp,
    );
    let optics = propagate_optics(
        tracker,
        &prop_init.orbit,
        &prop_init.w,
        range,
        scale,
        &plan.config,
        options.continue_if_lost,
    )?;
    let funcs = compute_lattice_functions(optics.w, &optics.s, plan.use_full_inverse)?;

    let circumference = tracker.circumference();
    let orbit = prop_init.orbit;
    let last = funcs.mux.len() - 1;

    let qx = funcs.mux[last];
    let qy = funcs.muy[last];
    let qs = funcs.muzeta[last].abs();
    let slip_factor = -optics.dzeta[last] / circumference;
    let momentum_compaction_factor = slip_factor + 1.0 / orbit.gamma0.powi(2);
    let mut betz0 = funcs.w[0][(4, 4)].powi(2) + funcs.w[0][(4, 5)].powi(2);
    if slip_factor < 0.0 {
        betz0 = -betz0;
    }
    let t_rev0 = circumference / (C_LIGHT * orbit.beta0);

    // Closest-tune-approach estimate from the coupled beta ratios
    // (arXiv:2005.02753).
    let rows = funcs.betx.len();
    let tune_split = (fractional(qx) - fractional(qy)).abs();
    let mut r1 = Vec::with_capacity(rows);
    let mut r2 = Vec::with_capacity(rows);
    let mut cmin = Vec::with_capacity(rows);
    for row in 0..rows {
        let r1_row = (funcs.bety1[row] / funcs.betx1[row]).sqrt();
        let r2_row = (funcs.betx2[row] / funcs.bety2[row]).sqrt();
        cmin.push(2.0 * (r1_row * r2_row).sqrt() * tune_split / (1.0 + r1_row * r2_row));
        r1.push(r1_row);
        r2.push(r2_row);
    }
    let c_minus = trapezoid(&cmin, &optics.s) / circumference;
    let c_r1_avg = trapezoid(&r1, &optics.s) / circumference;
    let c_r2_avg = trapezoid(&r2, &optics.s) / circumference;

    let mut table = TwissTable {
        name: optics.name,
        s: optics.s,
        x: optics.x,
        px: optics.px,
        y: optics.y,
        py: optics.py,
        zeta: optics.zeta,
        delta: optics.delta,
        ptau: optics.ptau,
        state: optics.state,
        betx: funcs.betx,
        bety: funcs.bety,
        alfx: funcs.alfx,
        alfy: funcs.alfy,
        gamx: funcs.gamx,
        gamy: funcs.gamy,
        betx1: funcs.betx1,
        bety1: funcs.bety1,
        betx2: funcs.betx2,
        bety2: funcs.bety2,
        dx: funcs.dx,
        dpx: funcs.dpx,
        dy: funcs.dy,
        dpy: funcs.dpy,
        dx_zeta: funcs.dx_zeta,
        dy_zeta: funcs.dy_zeta,
        mux: funcs.mux,
        muy: funcs.muy,
        muzeta: funcs.muzeta,
        dzeta: optics.dzeta,
        nux: funcs.nux,
        nuy: funcs.nuy,
        nuzeta: funcs.nuzeta,
        w: funcs.w,
        dmux: None,
        dmuy: None,
        qx,
        qy,
        qs,
        dqx: None,
        dqy: None,
        slip_factor,
        momentum_compaction_factor,
        betz0,
        circumference,
        t_rev0,
        c_minus,
        c_r1_avg,
        c_r2_avg,
        radiation: None,
        method: options.method,
        radiation_method: options.radiation_method,
        reference_frame: ReferenceFrame::Proper,
        particle_on_co: orbit,
        r_matrix: None,
        co_info: None,
    };

    if options.hide_thin_groups {
        hide_thin_group_rows(&mut table, &funcs.i_replace);
    }

    Ok((table, orientation))
}

/// Blanks the interior rows of zero-length groups, where the intermediate
/// values are not physically meaningful.
fn hide_thin_group_rows(table: &mut TwissTable, i_replace: &[usize]) {
    let columns: [&mut Vec<f64>; 22] = [
        &mut table.x,
        &mut table.px,
        &mut table.y,
        &mut table.py,
        &mut table.zeta,
        &mut table.delta,
        &mut table.ptau,
        &mut table.betx,
        &mut table.bety,
        &mut table.alfx,
        &mut table.alfy,
        &mut table.gamx,
        &mut table.gamy,
        &mut table.betx1,
        &mut table.bety1,
        &mut table.betx2,
        &mut table.bety2,
        &mut table.dx,
        &mut table.dpx,
        &mut table.dy,
        &mut table.dzeta,
        &mut table.dpy,
    ];
    for column in columns {
        for &row in i_replace {
            column[row] = f64::NAN;
        }
    }
}

/// Chromatic phase-advance derivatives: the open propagation is repeated
/// at the closed orbit shifted by ±`delta_chrom` along the longitudinal
/// eigenplane (transverse normalized amplitudes zero), with the transfer
/// matrix and W recomputed at each shifted orbit.
fn chromatic_functions<T: Tracker + ?Sized>(
    tracker: &T,
    init: &TwissInit,
    plan: &Plan,
    options: &TwissOptions,
) -> Result<(Vec<f64>, Vec<f64>, f64, f64)> {
    let mut branches: Vec<(Vec<f64>, Vec<f64>)> = Vec::with_capacity(2);
    for sign in [-1.0, 1.0] {
        let dd = sign * options.delta_chrom;

        let mut target = init.orbit;
        target.delta += dd;
        let dpzeta = target.pzeta() - init.orbit.pzeta();

        // Normalized longitudinal amplitudes that change delta by dd while
        // keeping zeta fixed.
        let block = Matrix2::new(
            init.w[(4, 4)],
            init.w[(4, 5)],
            init.w[(5, 4)],
            init.w[(5, 5)],
        );
        let amplitudes = block
            .lu()
            .solve(&Vector2::new(0.0, dpzeta))
            .ok_or(TwissError::Degenerate {
                context: "solving the longitudinal plane for the chromatic orbit shift",
            })?;
        let mut offsets = [0.0; 6];
        for (i, slot) in offsets.iter_mut().enumerate() {
            *slot = init.w[(i, 4)] * amplitudes[0] + init.w[(i, 5)] * amplitudes[1];
        }
        let orbit_chrom = init.orbit.shifted_canonical(offsets);

        let range = forward_range(plan);
        let rr = one_turn_matrix(
            tracker,
            &orbit_chrom,
            range,
            &options.steps_r_matrix,
            &plan.config,
        )?;
        let nf = compute_normal_form(
            &rr,
            plan.only_4d,
            options.symplectify,
            plan.responsiveness_tol,
            plan.stability_tol,
        )?;

        let scale = eigen_scale(
            &orbit_chrom,
            options.nemitt_x,
            options.nemitt_y,
            options.r_sigma,
            options.delta_disp,
        );
        let optics = propagate_optics(
            tracker,
            &orbit_chrom,
            &nf.w,
            range,
            scale,
            &plan.config,
            false,
        )?;
        let funcs = compute_lattice_functions(optics.w, &optics.s, plan.use_full_inverse)?;
        branches.push((funcs.mux, funcs.muy));
    }

    let (minus, plus) = (&branches[0], &branches[1]);
    let denom = 2.0 * options.delta_chrom;
    let dmux: Vec<f64> = plus
        .0
        .iter()
        .zip(&minus.0)
        .map(|(p, m)| (p - m) / denom)
        .collect();
    let dmuy: Vec<f64> = plus
        .1
        .iter()
        .zip(&minus.1)
        .map(|(p, m)| (p - m) / denom)
        .collect();
    let dqx = dmux[dmux.len() - 1];
    let dqy = dmuy[dmuy.len() - 1];
    Ok((dmux, dmuy, dqx, dqy))
}

/// Energy loss per turn from the closed-orbit ptau decrements and the
/// damping constants from the per-plane eigenvalue moduli.
fn radiation_quantities(
    orbit: &PhaseSpaceState,
    r_matrix: &Matrix6<f64>,
    ptau: &[f64],
    t_rev0: f64,
) -> Result<RadiationQuantities> {
    let mut lost = 0.0;
    for pair in ptau.windows(2) {
        let diff = pair[1] - pair[0];
        if diff < 0.0 {
            lost -= diff;
        }
    }
    let eneloss_turn = lost * orbit.p0c;

    let lambdas = plane_eigenvalues(r_matrix)?;
    let damping_constants_turns = lambdas.map(|lambda| -lambda.norm().ln());
    let damping_constants_s = damping_constants_turns.map(|d| d / t_rev0);
    let energy0 = orbit.mass0 * orbit.gamma0;
    let partition_numbers = damping_constants_turns.map(|d| d * 2.0 * energy0 / eneloss_turn);

    Ok(RadiationQuantities {
        eneloss_turn,
        damping_constants_turns,
        damping_constants_s,
        partition_numbers,
    })
}

/// Computes the optics of the line.
///
/// Periodic mode (the default) searches the closed orbit, estimates the
/// one-turn matrix, decomposes it, and propagates the result element by
/// element; global, coupling and chromatic quantities are attached. Open
/// mode propagates a given or preserved boundary condition over the
/// requested range and re-anchors the accumulated phases to it.
pub fn twiss<T: Tracker + ?Sized>(
    tracker: &T,
    particle_ref: &PhaseSpaceState,
    options: &TwissOptions,
) -> Result<TwissTable> {
    let plan = resolve_plan(tracker, options)?;

    let (init, r_matrix, co_info, periodic) = match &plan.init_spec {
        InitSpec::Periodic => {
            let (init, rr, info) = find_periodic_solution(tracker, particle_ref, options, &plan)?;
            (init, Some(rr), Some(info), true)
        }
        InitSpec::PreserveStart | InitSpec::PreserveEnd => {
            let mut full = options.clone();
            full.start = None;
            full.stop = None;
            full.init = Some(InitSpec::Periodic);
            full.at_elements = None;
            let tw0 = twiss(tracker, particle_ref, &full)?;
            let anchor_idx = if matches!(plan.init_spec, InitSpec::PreserveStart) {
                plan.start_idx
            } else {
                plan.stop_excl - 1
            };
            let init = tw0.get_twiss_init(tracker.element_name(anchor_idx))?;
            (init, None, None, false)
        }
        InitSpec::Boundary(init) => (init.clone(), None, None, false),
    };

    let (mut table, orientation) = twiss_open(tracker, &init, &plan, options)?;
    table.r_matrix = r_matrix;
    table.co_info = co_info;

    if periodic {
        if options.compute_chromatic_properties {
            let (dmux, dmuy, dqx, dqy) = chromatic_functions(tracker, &init, &plan, options)?;
            table.dmux = Some(dmux);
            table.dmuy = Some(dmuy);
            table.dqx = Some(dqx);
            table.dqy = Some(dqy);
        }
        if options.eneloss_and_damping {
            let rr = table.r_matrix.ok_or_else(|| {
                TwissError::Configuration(
                    "energy loss and damping require the one-turn matrix".into(),
                )
            })?;
            table.radiation = Some(radiation_quantities(
                &table.particle_on_co,
                &rr,
                &table.ptau,
                table.t_rev0,
            )?);
        }
    }

    if plan.only_4d {
        table.qs = 0.0;
        for value in &mut table.muzeta {
            *value = 0.0;
        }
    }

    if options.reverse {
        table = table.reverse();
    }

    if !periodic {
        let anchor_last = matches!(
            (orientation, options.reverse),
            (Orientation::Forward, true) | (Orientation::Backward, false)
        );
        let idx = if anchor_last { table.row_count() - 1 } else { 0 };
        let rezero = |column: &mut Vec<f64>, target: f64| {
            let shift = target - column[idx];
            for value in column.iter_mut() {
                *value += shift;
            }
        };
        rezero(&mut table.mux, init.mux);
        rezero(&mut table.muy, init.muy);
        rezero(&mut table.muzeta, init.muzeta);
        rezero(&mut table.dzeta, init.dzeta);
    }

    if let Some(names) = &options.at_elements {
        table = table.rows_named(names)?;
    }

    Ok(table)
}

/// Optics at arbitrary longitudinal positions: zero-length markers are
/// spliced into a copy of the line and the result is restricted to them.
/// Not available combined with `reverse`.
pub fn twiss_at_s<T: Splicable>(
    tracker: &T,
    particle_ref: &PhaseSpaceState,
    at_s: &[f64],
    options: &TwissOptions,
) -> Result<TwissTable> {
    if options.reverse {
        return Err(TwissError::Configuration(
            "position-based queries are not available in reverse mode".into(),
        ));
    }
    if options.at_elements.is_some() {
        return Err(TwissError::Configuration(
            "at_elements cannot be combined with position-based queries".into(),
        ));
    }
    let (aux, markers) = tracker.with_markers_at(at_s, "twiss_marker_at_s_")?;
    let mut aux_options = options.clone();
    aux_options.at_elements = Some(markers);
    twiss(&aux, particle_ref, &aux_options)
}
