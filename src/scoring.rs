//! Profitability scoring: Amazon fees, VAT due, profit, ROI and the
//! back-solved maximum buy cost, plus the ordered row fail reasons.
//!
//! Everything here is a pure function of the row, the export fee fields
//! and the scan configuration.

use crate::models::{BulkExportRow, MatchSource, ScanConfig};

pub const REASON_MISSING_IDENTIFIERS: &str = "Missing ASIN and barcode";
pub const REASON_MISSING_COST: &str = "Missing cost";
pub const REASON_UNMATCHED: &str = "No match found";
pub const REASON_MISSING_SELL_PRICE: &str = "Missing sell price";
pub const REASON_MISSING_BSR: &str = "Missing BSR";
pub const REASON_ROI_BELOW: &str = "ROI below threshold";
pub const REASON_PROFIT_BELOW: &str = "Profit below threshold";
pub const REASON_BSR_ABOVE: &str = "BSR above threshold";
pub const REASON_DUPLICATE: &str = "Duplicate identifier in input";

#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub sell_price: f64,
    pub cost: f64,
    /// False for identifier-only scans; forces profit/ROI/max-buy to 0.
    pub cost_known: bool,
    pub export: Option<&'a BulkExportRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Financials {
    pub referral_fee: f64,
    pub fulfilment_fee: f64,
    pub amazon_fees: f64,
    pub vat_due: f64,
    pub total_cost: f64,
    pub profit: f64,
    pub roi: f64,
    pub max_buy_cost: f64,
}

pub fn score(input: &ScoreInput<'_>, cfg: &ScanConfig) -> Financials {
    let sell = input.sell_price.max(0.0);
    let referral_fee = referral_fee(sell, input.export, cfg);
    let fulfilment_fee = input
        .export
        .map(|row| row.fba_fee)
        .filter(|fee| *fee > 0.0)
        .unwrap_or(cfg.default_fulfilment_fee);

    let subtotal = referral_fee + cfg.per_item_fee + cfg.variable_closing_fee + fulfilment_fee;
    let amazon_fees = subtotal * (1.0 + cfg.digital_services_percent / 100.0);

    let vat_due = vat_due(sell, input.cost, amazon_fees, cfg);

    let total_cost = input.cost
        + cfg.prep_fee
        + cfg.inbound_fee
        + cfg.misc_fee
        + cfg.storage_fee
        + amazon_fees
        + vat_due
        - cfg.discount;

    if !input.cost_known {
        return Financials {
            referral_fee,
            fulfilment_fee,
            amazon_fees,
            vat_due,
            total_cost,
            profit: 0.0,
            roi: 0.0,
            max_buy_cost: 0.0,
        };
    }

    let profit = sell - total_cost;
    let roi = if input.cost > 0.0 {
        profit / input.cost * 100.0
    } else {
        0.0
    };

    let non_product_costs = total_cost - input.cost;
    let max_by_profit = (sell - non_product_costs - cfg.min_profit).max(0.0);
    let max_by_roi = if cfg.min_roi_percent <= -100.0 {
        0.0
    } else {
        ((sell - non_product_costs) / (1.0 + cfg.min_roi_percent / 100.0)).max(0.0)
    };
    let max_buy_cost = max_by_profit.min(max_by_roi).max(0.0);

    Financials {
        referral_fee,
        fulfilment_fee,
        amazon_fees,
        vat_due,
        total_cost,
        profit,
        roi,
        max_buy_cost,
    }
}

fn referral_fee(sell: f64, export: Option<&BulkExportRow>, cfg: &ScanConfig) -> f64 {
    if let Some(row) = export {
        if row.referral_fee_absolute > 0.0 {
            return row.referral_fee_absolute;
        }
        if row.referral_fee_percent > 0.0 {
            return row.referral_fee_percent / 100.0 * sell;
        }
    }
    cfg.referral_fee_percent / 100.0 * sell
}

fn vat_due(sell: f64, cost: f64, fees: f64, cfg: &ScanConfig) -> f64 {
    if cfg.vat_rate <= 0.0 {
        return 0.0;
    }
    let rate = cfg.vat_rate / 100.0;
    let vat_portion = |amount: f64| amount * rate / (1.0 + rate);
    if cfg.vat_registered && cfg.use_vat_due_model {
        (vat_portion(sell) - vat_portion(cost) - vat_portion(fees)).max(0.0)
    } else if cfg.include_estimated_vat_on_sale {
        vat_portion(sell)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReasonInput {
    pub has_asin: bool,
    pub has_barcode: bool,
    pub cost: f64,
    pub cost_known: bool,
    pub match_source: MatchSource,
    pub sell_price: f64,
    pub bsr: u64,
    pub roi: f64,
    pub profit: f64,
}

/// Appends fail reasons in a fixed order so `status` (the first reason)
/// is deterministic. Reasons accumulate; they are not exclusive.
pub fn fail_reasons(input: &ReasonInput, cfg: &ScanConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    if !input.has_asin && !input.has_barcode {
        reasons.push(REASON_MISSING_IDENTIFIERS.to_string());
    }
    if input.cost_known && input.cost <= 0.0 {
        reasons.push(REASON_MISSING_COST.to_string());
    }
    if input.match_source == MatchSource::Unmatched {
        reasons.push(REASON_UNMATCHED.to_string());
    }
    if input.sell_price <= 0.0 {
        reasons.push(REASON_MISSING_SELL_PRICE.to_string());
    }
    if input.bsr == 0 {
        reasons.push(REASON_MISSING_BSR.to_string());
    }
    let thresholds_apply = input.cost_known && input.cost > 0.0 && input.sell_price > 0.0;
    if thresholds_apply && input.roi < cfg.min_roi_percent {
        reasons.push(REASON_ROI_BELOW.to_string());
    }
    if thresholds_apply && input.profit < cfg.min_profit {
        reasons.push(REASON_PROFIT_BELOW.to_string());
    }
    if cfg.max_bsr > 0 && input.bsr > cfg.max_bsr {
        reasons.push(REASON_BSR_ABOVE.to_string());
    }
    reasons
}

pub fn status_from(reasons: &[String]) -> String {
    reasons
        .first()
        .cloned()
        .unwrap_or_else(|| "Qualified".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vat_uk_config() -> ScanConfig {
        ScanConfig {
            referral_fee_percent: 15.0,
            default_fulfilment_fee: 3.04,
            digital_services_percent: 2.0,
            vat_registered: true,
            vat_rate: 20.0,
            use_vat_due_model: false,
            include_estimated_vat_on_sale: true,
            prep_fee: 0.0,
            inbound_fee: 0.0,
            misc_fee: 0.0,
            storage_fee: 0.0,
            discount: 0.0,
            min_profit: 2.0,
            min_roi_percent: 25.0,
            ..ScanConfig::default()
        }
    }

    fn close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn vat_on_sale_scenario_exact() {
        let cfg = vat_uk_config();
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 5.0,
                cost_known: true,
                export: None,
            },
            &cfg,
        );
        close(out.referral_fee, 3.0);
        // 3.00 referral + 3.04 fulfilment, 2% digital services surcharge
        close(out.amazon_fees, 6.04 * 1.02);
        close(out.vat_due, 20.0 * 0.2 / 1.2);
        let expected_total = 5.0 + 6.04 * 1.02 + 20.0 * 0.2 / 1.2;
        close(out.total_cost, expected_total);
        close(out.profit, 20.0 - expected_total);
        close(out.roi, (20.0 - expected_total) / 5.0 * 100.0);
    }

    #[test]
    fn vat_due_model_nets_out_input_vat() {
        let cfg = ScanConfig {
            use_vat_due_model: true,
            ..vat_uk_config()
        };
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 5.0,
                cost_known: true,
                export: None,
            },
            &cfg,
        );
        let portion = |amount: f64| amount * 0.2 / 1.2;
        let expected = (portion(20.0) - portion(5.0) - portion(6.04 * 1.02)).max(0.0);
        close(out.vat_due, expected);
    }

    #[test]
    fn vat_due_never_negative() {
        let cfg = ScanConfig {
            use_vat_due_model: true,
            ..vat_uk_config()
        };
        let out = score(
            &ScoreInput {
                sell_price: 1.0,
                cost: 50.0,
                cost_known: true,
                export: None,
            },
            &cfg,
        );
        close(out.vat_due, 0.0);
    }

    #[test]
    fn export_absolute_referral_wins_over_percent() {
        let cfg = vat_uk_config();
        let export = BulkExportRow {
            asin: "B000000001".into(),
            referral_fee_absolute: 2.5,
            referral_fee_percent: 12.0,
            fba_fee: 2.8,
            ..blank_export()
        };
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 5.0,
                cost_known: true,
                export: Some(&export),
            },
            &cfg,
        );
        close(out.referral_fee, 2.5);
        close(out.fulfilment_fee, 2.8);
    }

    #[test]
    fn export_percent_used_when_no_absolute() {
        let cfg = vat_uk_config();
        let export = BulkExportRow {
            asin: "B000000001".into(),
            referral_fee_percent: 12.0,
            ..blank_export()
        };
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 5.0,
                cost_known: true,
                export: Some(&export),
            },
            &cfg,
        );
        close(out.referral_fee, 2.4);
        // export fba_fee of 0 falls through to the configured default
        close(out.fulfilment_fee, 3.04);
    }

    #[test]
    fn max_buy_cost_back_solves_both_constraints() {
        let cfg = vat_uk_config();
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 5.0,
                cost_known: true,
                export: None,
            },
            &cfg,
        );
        let non_product = out.total_cost - 5.0;
        let by_profit = (20.0 - non_product - 2.0).max(0.0);
        let by_roi = ((20.0 - non_product) / 1.25).max(0.0);
        close(out.max_buy_cost, by_profit.min(by_roi));
    }

    #[test]
    fn max_buy_cost_zero_when_roi_threshold_degenerate() {
        let cfg = ScanConfig {
            min_roi_percent: -100.0,
            ..vat_uk_config()
        };
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 5.0,
                cost_known: true,
                export: None,
            },
            &cfg,
        );
        close(out.max_buy_cost, 0.0);
    }

    #[test]
    fn unknown_cost_zeroes_profit_roi_max_buy() {
        let cfg = vat_uk_config();
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 0.0,
                cost_known: false,
                export: None,
            },
            &cfg,
        );
        close(out.profit, 0.0);
        close(out.roi, 0.0);
        close(out.max_buy_cost, 0.0);
        // fees are still reported for display
        close(out.referral_fee, 3.0);
    }

    #[test]
    fn roi_zero_when_cost_zero() {
        let cfg = vat_uk_config();
        let out = score(
            &ScoreInput {
                sell_price: 20.0,
                cost: 0.0,
                cost_known: true,
                export: None,
            },
            &cfg,
        );
        close(out.roi, 0.0);
    }

    #[test]
    fn fail_reasons_fixed_order() {
        let cfg = ScanConfig {
            min_roi_percent: 25.0,
            min_profit: 2.0,
            max_bsr: 100,
            ..ScanConfig::default()
        };
        let reasons = fail_reasons(
            &ReasonInput {
                has_asin: false,
                has_barcode: false,
                cost: 0.0,
                cost_known: true,
                match_source: MatchSource::Unmatched,
                sell_price: 0.0,
                bsr: 0,
                roi: 0.0,
                profit: 0.0,
            },
            &cfg,
        );
        assert_eq!(
            reasons,
            vec![
                REASON_MISSING_IDENTIFIERS,
                REASON_MISSING_COST,
                REASON_UNMATCHED,
                REASON_MISSING_SELL_PRICE,
                REASON_MISSING_BSR,
            ]
        );
        assert_eq!(status_from(&reasons), REASON_MISSING_IDENTIFIERS);
    }

    #[test]
    fn qualified_row_has_no_reasons() {
        let cfg = vat_uk_config();
        let reasons = fail_reasons(
            &ReasonInput {
                has_asin: true,
                has_barcode: true,
                cost: 5.0,
                cost_known: true,
                match_source: MatchSource::CsvAsin,
                sell_price: 20.0,
                bsr: 1200,
                roi: 80.0,
                profit: 4.0,
            },
            &cfg,
        );
        assert!(reasons.is_empty());
        assert_eq!(status_from(&reasons), "Qualified");
    }

    #[test]
    fn bsr_above_threshold_flagged() {
        let cfg = ScanConfig {
            max_bsr: 1000,
            ..vat_uk_config()
        };
        let reasons = fail_reasons(
            &ReasonInput {
                has_asin: true,
                has_barcode: false,
                cost: 5.0,
                cost_known: true,
                match_source: MatchSource::CsvAsin,
                sell_price: 20.0,
                bsr: 5000,
                roi: 80.0,
                profit: 4.0,
            },
            &cfg,
        );
        assert_eq!(reasons, vec![REASON_BSR_ABOVE]);
    }

    fn blank_export() -> BulkExportRow {
        BulkExportRow {
            asin: String::new(),
            eans: vec![],
            sell_price: 0.0,
            buy_box_current: 0.0,
            buy_box_90d_avg: 0.0,
            bsr: 0,
            bsr_drops_90d: 0,
            new_offer_count: 0,
            amazon_in_stock_percent: 0.0,
            fba_fee: 0.0,
            referral_fee_absolute: 0.0,
            referral_fee_percent: 0.0,
            title: String::new(),
        }
    }
}
