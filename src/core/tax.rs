pub const REBATE_THRESHOLD: f64 = 700_000.0;
pub const SURCHARGE: f64 = 1.04;
pub const CAPITAL_GAINS_RATE: f64 = 0.125;
pub const CAPITAL_GAINS_EXEMPTION_PER_ASSESSEE: f64 = 125_000.0;

/// (lower bound, marginal rate) per slab, ascending.
const SLABS: [(f64, f64); 6] = [
    (0.0, 0.0),
    (300_000.0, 0.05),
    (700_000.0, 0.10),
    (1_000_000.0, 0.15),
    (1_200_000.0, 0.20),
    (1_500_000.0, 0.30),
];

/// Slab tax with surcharge. Income at or below the rebate threshold owes nothing.
pub fn progressive_tax(annual_income: f64) -> f64 {
    if annual_income <= REBATE_THRESHOLD {
        return 0.0;
    }

    let mut tax = 0.0;
    for (idx, &(lower, rate)) in SLABS.iter().enumerate() {
        if annual_income <= lower {
            break;
        }
        let upper = SLABS
            .get(idx + 1)
            .map(|&(next, _)| next)
            .unwrap_or(f64::INFINITY);
        tax += (annual_income.min(upper) - lower) * rate;
    }
    tax * SURCHARGE
}

pub fn capital_gains_tax(gain: f64, exemption: f64, rate: f64) -> f64 {
    (gain - exemption).max(0.0) * rate
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnualTaxBill {
    pub income_tax: f64,
    pub capital_gains_tax: f64,
}

impl AnnualTaxBill {
    pub fn total(self) -> f64 {
        self.income_tax + self.capital_gains_tax
    }
}

/// Joint assessment splits ordinary income across two assessees and doubles
/// the capital-gains exemption.
pub fn annual_tax_bill(ordinary_income: f64, capital_gain: f64, is_joint: bool) -> AnnualTaxBill {
    let income_tax = if is_joint {
        progressive_tax(ordinary_income / 2.0) * 2.0
    } else {
        progressive_tax(ordinary_income)
    };

    let assessees = if is_joint { 2.0 } else { 1.0 };
    let exemption = CAPITAL_GAINS_EXEMPTION_PER_ASSESSEE * assessees;

    AnnualTaxBill {
        income_tax,
        capital_gains_tax: capital_gains_tax(capital_gain, exemption, CAPITAL_GAINS_RATE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 0.05,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn progressive_tax_matches_slab_table() {
        for (income, expected) in [
            (250_000.0, 0.0),
            (300_000.0, 0.0),
            (500_000.0, 0.0),
            (700_000.0, 0.0),
            (700_100.0, 20_810.4),
            (900_000.0, 41_600.0),
            (1_000_000.0, 52_000.0),
            (1_500_000.0, 145_600.0),
        ] {
            assert_approx(progressive_tax(income), expected);
        }
    }

    #[test]
    fn progressive_tax_top_slab_is_thirty_percent_plus_surcharge() {
        let at_top = progressive_tax(1_500_000.0);
        let above = progressive_tax(1_600_000.0);
        assert_approx(above - at_top, 100_000.0 * 0.30 * SURCHARGE);
    }

    #[test]
    fn capital_gains_tax_applies_exemption_then_rate() {
        assert_eq!(capital_gains_tax(100_000.0, 125_000.0, CAPITAL_GAINS_RATE), 0.0);
        assert_eq!(
            capital_gains_tax(225_000.0, 125_000.0, CAPITAL_GAINS_RATE),
            12_500.0
        );
        assert_eq!(
            capital_gains_tax(300_000.0, 250_000.0, CAPITAL_GAINS_RATE),
            6_250.0
        );
    }

    #[test]
    fn joint_assessment_splits_income_and_doubles_exemption() {
        let single = annual_tax_bill(1_600_000.0, 250_000.0, false);
        let joint = annual_tax_bill(1_600_000.0, 250_000.0, true);

        assert_approx(single.income_tax, progressive_tax(1_600_000.0));
        assert_approx(joint.income_tax, progressive_tax(800_000.0) * 2.0);
        assert!(joint.income_tax < single.income_tax);

        assert_approx(single.capital_gains_tax, 125_000.0 * CAPITAL_GAINS_RATE);
        assert_eq!(joint.capital_gains_tax, 0.0);
        assert_approx(single.total(), single.income_tax + single.capital_gains_tax);
    }
}
