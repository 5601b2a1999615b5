use approx::assert_abs_diff_eq;
use kinmat::config::{KinshipConfig, StageMode, TimeMode};
use kinmat::coupler::{Sex, SexMode};
use kinmat::engine::{KinshipOutput, KinshipRates, compute_kinship};
use kinmat::kin_type::{KinSelection, KinType};
use kinmat::operators::TerminalAge;
use kinmat::rates::{HorizonPolicy, RateInput, VitalRates};
use kinmat::stable::ParentalAges;
use ndarray::{Array1, Array2, array};

const AGES: usize = 101;

fn single_birth_at_thirty() -> VitalRates {
    let mut fertility = Array1::zeros(AGES);
    fertility[30] = 1.0;
    VitalRates::age_only(Array1::ones(AGES), fertility)
}

fn living(output: &KinshipOutput, kin: KinType, focal_age: usize, sex: Option<Sex>) -> f64 {
    output
        .summary_of(kin)
        .filter(|row| row.focal_age == focal_age && (sex.is_none() || row.sex == sex))
        .map(|row| row.count_living)
        .sum()
}

/// A smooth schedule with deaths at every age and births between 15 and 45.
fn human_like(ages: usize, fertility_scale: f64) -> VitalRates {
    let survival = Array1::from_shape_fn(ages, |age| {
        let hazard = 0.002 + 0.0008 * (0.09 * age as f64).exp();
        (-hazard).exp().min(1.0)
    });
    let fertility = Array1::from_shape_fn(ages, |age| {
        if (15..=45).contains(&age) {
            let x = (age as f64 - 28.0) / 6.0;
            fertility_scale * 0.11 * (-0.5 * x * x).exp()
        } else {
            0.0
        }
    });
    VitalRates::age_only(survival, fertility)
}

#[test]
fn one_sex_daughters_arrive_at_thirty_one() {
    let rates = KinshipRates::female_only(RateInput::Constant(single_birth_at_thirty()));
    let config = KinshipConfig {
        output_kin: KinSelection::Only(vec![KinType::D, KinType::M]),
        ..KinshipConfig::default()
    };
    let output = compute_kinship(&rates, &config).unwrap();
    assert_abs_diff_eq!(living(&output, KinType::D, 31, None), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(living(&output, KinType::D, 29, None), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(living(&output, KinType::M, 0, None), 1.0, epsilon = 1e-12);

    let mother_age = output
        .summary_of(KinType::M)
        .find(|row| row.focal_age == 0)
        .and_then(|row| row.mean_age)
        .unwrap();
    assert_abs_diff_eq!(mother_age, 30.0, epsilon = 1e-9);
}

#[test]
fn two_sex_daughters_and_sons_split_evenly() {
    let rates = KinshipRates::two_sex(
        RateInput::Constant(single_birth_at_thirty()),
        RateInput::Constant(single_birth_at_thirty()),
    );
    let config = KinshipConfig {
        sex_mode: SexMode::TwoSex { birth_female: 0.5 },
        output_kin: KinSelection::Only(vec![KinType::D]),
        ..KinshipConfig::default()
    };
    let output = compute_kinship(&rates, &config).unwrap();
    let daughters = living(&output, KinType::D, 31, Some(Sex::Female));
    let sons = living(&output, KinType::D, 31, Some(Sex::Male));
    assert_abs_diff_eq!(daughters, 0.5, epsilon = 1e-12);
    assert_abs_diff_eq!(sons, 0.5, epsilon = 1e-12);
}

#[test]
fn androgynous_model_doubles_and_quadruples_one_sex_counts() {
    let one_sex = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(human_like(90, 1.0))),
        &KinshipConfig::default(),
    )
    .unwrap();
    // Twice the daughters-only fertility counts births of both sexes.
    let both = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(human_like(90, 2.0))),
        &KinshipConfig {
            sex_mode: SexMode::Androgynous { birth_female: 0.5 },
            ..KinshipConfig::default()
        },
    )
    .unwrap();

    for focal_age in [0, 10, 35, 60, 89] {
        for (kin, factor) in [
            (KinType::D, 2.0),
            (KinType::M, 2.0),
            (KinType::Ys, 2.0),
            (KinType::Gm, 4.0),
        ] {
            let reference = living(&one_sex, kin, focal_age, None);
            let scaled = living(&both, kin, focal_age, None);
            assert_abs_diff_eq!(scaled, factor * reference, epsilon = 1e-8 * (1.0 + reference));
        }
    }
}

#[test]
fn male_focal_has_the_same_siblings_as_a_female_focal() {
    let female = RateInput::Constant(human_like(80, 2.0));
    let mut male_rates = human_like(80, 1.6);
    male_rates.survival.mapv_inplace(|s| s * 0.995);
    let rates = KinshipRates::two_sex(female, RateInput::Constant(male_rates));
    let config = |focal_sex| KinshipConfig {
        focal_sex,
        sex_mode: SexMode::TwoSex {
            birth_female: 1.0 / 2.04,
        },
        output_kin: KinSelection::Only(vec![KinType::Os, KinType::Nos, KinType::D]),
        ..KinshipConfig::default()
    };
    let as_female = compute_kinship(&rates, &config(Sex::Female)).unwrap();
    let as_male = compute_kinship(&rates, &config(Sex::Male)).unwrap();
    for focal_age in [0, 20, 50] {
        for kin in [KinType::Os, KinType::Nos] {
            assert_abs_diff_eq!(
                living(&as_female, kin, focal_age, None),
                living(&as_male, kin, focal_age, None),
                epsilon = 1e-10
            );
        }
    }
    // Children follow the Focal's own fertility and survival.
    let own_children = living(&as_male, KinType::D, 40, None);
    assert!(own_children > 0.0);
    assert!((own_children - living(&as_female, KinType::D, 40, None)).abs() > 1e-6);
}

#[test]
fn constant_periods_reproduce_the_time_invariant_run() {
    let rates = human_like(60, 1.0);
    let invariant = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(rates.clone())),
        &KinshipConfig {
            summary_only: true,
            ..KinshipConfig::default()
        },
    )
    .unwrap();
    let varying = compute_kinship(
        &KinshipRates::female_only(RateInput::Periods {
            first_year: 1950,
            periods: vec![rates; 12],
        }),
        &KinshipConfig {
            summary_only: true,
            time_mode: TimeMode::Varying {
                output_years: vec![1958],
                output_cohorts: vec![],
                horizon: HorizonPolicy::HoldLast,
            },
            ..KinshipConfig::default()
        },
    )
    .unwrap();

    assert_eq!(invariant.summary.len(), varying.summary.len());
    for (a, b) in invariant.summary.iter().zip(&varying.summary) {
        assert_eq!((a.kin, a.focal_age), (b.kin, b.focal_age));
        assert_eq!(b.year, Some(1958));
        assert_abs_diff_eq!(a.count_living, b.count_living, epsilon = 1e-12);
        assert_abs_diff_eq!(a.count_cum_dead, b.count_cum_dead, epsilon = 1e-12);
    }
}

#[test]
fn daughters_follow_the_rates_of_the_childbearing_years() {
    let early = human_like(60, 1.2);
    let late = human_like(60, 0.6);
    let mut periods = vec![early; 5];
    periods.extend(vec![late; 85]);
    let output = compute_kinship(
        &KinshipRates::female_only(RateInput::Periods {
            first_year: 1900,
            periods,
        }),
        &KinshipConfig {
            output_kin: KinSelection::Only(vec![KinType::D, KinType::M]),
            time_mode: TimeMode::Varying {
                output_years: vec![],
                output_cohorts: vec![1900, 1930],
                horizon: HorizonPolicy::Fail,
            },
            ..KinshipConfig::default()
        },
    )
    .unwrap();
    let at = |kin, cohort, focal_age| {
        output
            .summary_of(kin)
            .find(|row| row.cohort == Some(cohort) && row.focal_age == focal_age)
            .map(|row| row.count_living)
            .unwrap()
    };
    // Both cohorts reach age 15 after the change in 1905.
    assert_abs_diff_eq!(at(KinType::D, 1900, 50), at(KinType::D, 1930, 50), epsilon = 1e-12);
    // Mothers of the 1900 cohort were born into the earlier rates.
    assert!((at(KinType::M, 1900, 0) - at(KinType::M, 1930, 0)).abs() < 1e-12);
    assert!((at(KinType::M, 1900, 40) - at(KinType::M, 1930, 40)).abs() > 1e-9);

    for cohort in [1900, 1930] {
        let rows = output
            .summary_of(KinType::D)
            .filter(|row| row.cohort == Some(cohort))
            .count();
        assert_eq!(rows, 60);
    }
}

#[test]
fn stage_independent_rates_match_the_age_only_model() {
    let base = human_like(50, 1.0);
    let stages = 2;
    let widen = |m: &Array1<f64>| Array2::from_shape_fn((50, stages), |(age, _)| m[age]);
    let staged = VitalRates {
        survival: widen(&base.survival.column(0).to_owned()),
        fertility: widen(&base.fertility.column(0).to_owned()),
        stage_transitions: Some(
            (0..50)
                .map(|age| {
                    let p = if age < 20 { 0.1 } else { 0.3 };
                    ndarray::array![[1.0 - p, 0.2], [p, 0.8]]
                })
                .collect(),
        ),
        birth_stages: None,
        causes: None,
        population: None,
    };
    let age_only = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(base)),
        &KinshipConfig::default(),
    )
    .unwrap();
    let multistage = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(staged)),
        &KinshipConfig {
            stage_mode: StageMode::Staged { stages },
            ..KinshipConfig::default()
        },
    )
    .unwrap();
    for kin in KinType::ALL {
        for focal_age in [0, 25, 49] {
            assert_abs_diff_eq!(
                living(&age_only, kin, focal_age, None),
                living(&multistage, kin, focal_age, None),
                epsilon = 1e-9
            );
        }
    }
    let full = multistage.full.as_ref().unwrap();
    assert!(full.iter().any(|row| row.stage == Some(2) && row.living > 0.0));
}

#[test]
fn factor_mode_scales_one_sex_counts() {
    let rates = KinshipRates::female_only(RateInput::Constant(human_like(70, 1.0)));
    let one_sex = compute_kinship(&rates, &KinshipConfig::default()).unwrap();
    let factors = compute_kinship(
        &rates,
        &KinshipConfig {
            sex_mode: SexMode::Factors,
            ..KinshipConfig::default()
        },
    )
    .unwrap();
    for kin in KinType::ALL {
        let reference = living(&one_sex, kin, 30, None);
        let female = living(&factors, kin, 30, Some(Sex::Female));
        let male = living(&factors, kin, 30, Some(Sex::Male));
        assert_abs_diff_eq!(female, male, epsilon = 1e-12);
        assert_abs_diff_eq!(female + male, kin.gkp_factor() * reference, epsilon = 1e-10);
    }
}

#[test]
fn observed_population_sets_the_age_of_mothers() {
    let mut rates = human_like(60, 1.0);
    let mut population = Array2::zeros((60, 1));
    population[[25, 0]] = 1000.0;
    rates.population = Some(population);
    let output = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(rates)),
        &KinshipConfig {
            parental_ages: ParentalAges::Observed,
            output_kin: KinSelection::Only(vec![KinType::M]),
            ..KinshipConfig::default()
        },
    )
    .unwrap();
    let at_birth = output
        .summary_of(KinType::M)
        .find(|row| row.focal_age == 0)
        .unwrap();
    assert_abs_diff_eq!(at_birth.mean_age.unwrap(), 25.0, epsilon = 1e-12);
    assert_abs_diff_eq!(at_birth.sd_age.unwrap(), 0.0, epsilon = 1e-6);
}

/// Six ages, survival 0.9 and all births at one age.
fn births_only_at(fertile_age: usize) -> VitalRates {
    let mut fertility = Array1::zeros(6);
    fertility[fertile_age] = 1.0;
    VitalRates::age_only(Array1::from_elem(6, 0.9), fertility)
}

#[test]
fn each_birth_cohort_draws_its_mothers_from_its_own_year() {
    let output = compute_kinship(
        &KinshipRates::female_only(RateInput::Periods {
            first_year: 2000,
            periods: vec![births_only_at(2), births_only_at(4), births_only_at(4)],
        }),
        &KinshipConfig {
            output_kin: KinSelection::Only(vec![KinType::M]),
            time_mode: TimeMode::Varying {
                output_years: vec![2001],
                output_cohorts: vec![],
                horizon: HorizonPolicy::HoldLast,
            },
            ..KinshipConfig::default()
        },
    )
    .unwrap();
    let mother_age = |focal_age| {
        output
            .summary_of(KinType::M)
            .find(|row| row.year == Some(2001) && row.focal_age == focal_age)
            .and_then(|row| row.mean_age)
            .unwrap()
    };
    assert_abs_diff_eq!(mother_age(0), 4.0, epsilon = 1e-12);
    // Born in 2000 to a mother aged two, one year older now.
    assert_abs_diff_eq!(mother_age(1), 3.0, epsilon = 1e-12);
}

#[test]
fn newborn_kin_enter_the_birth_stage_and_then_transition() {
    const STAGED_AGES: usize = 8;
    // Newborns of either stage start in stage 2; everyone moves to stage 1 at age 1.
    let transitions = (0..STAGED_AGES)
        .map(|age| {
            if age == 1 {
                array![[1.0, 1.0], [0.0, 0.0]]
            } else {
                Array2::eye(2)
            }
        })
        .collect();
    let rates = VitalRates {
        survival: Array2::from_elem((STAGED_AGES, 2), 0.9),
        fertility: Array2::from_shape_fn((STAGED_AGES, 2), |(age, _)| {
            if (2..4).contains(&age) { 0.6 } else { 0.0 }
        }),
        stage_transitions: Some(transitions),
        birth_stages: Some(array![[0.0, 0.0], [1.0, 1.0]]),
        causes: None,
        population: None,
    };
    let output = compute_kinship(
        &KinshipRates::female_only(RateInput::Constant(rates)),
        &KinshipConfig {
            stage_mode: StageMode::Staged { stages: 2 },
            output_kin: KinSelection::Only(vec![KinType::D, KinType::Ys]),
            ..KinshipConfig::default()
        },
    )
    .unwrap();

    let full = output.full.as_ref().unwrap();
    for kin in [KinType::D, KinType::Ys] {
        let present: Vec<_> = full
            .iter()
            .filter(|row| row.kin == kin && row.living > 0.0)
            .collect();
        assert!(present.iter().any(|row| row.kin_age == 0), "{kin}");
        for row in present {
            let expected = if row.kin_age < 2 { 2 } else { 1 };
            assert_eq!(row.stage, Some(expected), "{row:?}");
        }
    }
}

#[test]
fn closed_terminal_age_loses_everyone_past_the_last_age() {
    let mut fertility = Array1::zeros(8);
    fertility[2] = 0.5;
    fertility[3] = 0.5;
    let rates = KinshipRates::female_only(RateInput::Constant(VitalRates::age_only(
        Array1::from_elem(8, 0.9),
        fertility,
    )));
    let config = |terminal_age| KinshipConfig {
        terminal_age,
        output_kin: KinSelection::Only(vec![KinType::M, KinType::Gm]),
        ..KinshipConfig::default()
    };
    let open = compute_kinship(&rates, &config(TerminalAge::Open)).unwrap();
    let closed = compute_kinship(&rates, &config(TerminalAge::Closed)).unwrap();

    // Mothers were at least two at Focal's birth, so past the last age by Focal age 6.
    assert!(living(&open, KinType::M, 6, None) > 0.0);
    assert_eq!(living(&closed, KinType::M, 6, None), 0.0);

    for kin in [KinType::M, KinType::Gm] {
        for focal_age in 0..7 {
            let at = |focal_age| {
                closed
                    .summary_of(kin)
                    .find(|row| row.focal_age == focal_age)
                    .map(|row| (row.count_living, row.count_dead))
                    .unwrap()
            };
            let (living_now, _) = at(focal_age);
            let (living_next, died) = at(focal_age + 1);
            assert_abs_diff_eq!(living_now, living_next + died, epsilon = 1e-12);
        }
    }
}
