// ===============================
// src/fees.rs
// ===============================
//
// KRX round-trip cost model. Buy side pays the brokerage fee only; the sell
// side pays the brokerage fee plus transaction tax. All net-P&L math in the
// rest of the crate goes through this schedule so the numbers stay identical
// wherever they are computed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub buy_fee_rate: f64,
    pub sell_fee_rate: f64,
    pub sell_tax_rate: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            buy_fee_rate: 0.000140527,  // 0.0140527%
            sell_fee_rate: 0.000130527, // 0.0130527%
            sell_tax_rate: 0.002,       // 0.20%
        }
    }
}

impl FeeSchedule {
    pub fn buy_fee(&self, buy_amount: f64) -> f64 {
        buy_amount * self.buy_fee_rate
    }

    pub fn sell_fee(&self, sell_amount: f64) -> f64 {
        sell_amount * (self.sell_fee_rate + self.sell_tax_rate)
    }

    /// Cash needed to acquire `qty` shares at `price`, fee included.
    pub fn total_buy_cost(&self, price: f64, qty: i64) -> f64 {
        let amount = price * qty as f64;
        amount + self.buy_fee(amount)
    }

    /// Cash received for selling `qty` shares at `price`, fee and tax deducted.
    pub fn net_proceeds(&self, price: f64, qty: i64) -> f64 {
        let amount = price * qty as f64;
        amount - self.sell_fee(amount)
    }

    /// Fee-inclusive profit for a buy at `entry` and a sell at `exit`.
    pub fn net_pnl(&self, entry: f64, exit: f64, qty: i64) -> f64 {
        self.net_proceeds(exit, qty) - self.total_buy_cost(entry, qty)
    }

    /// Fee-inclusive return in percent, independent of quantity.
    pub fn net_pnl_pct(&self, entry: f64, exit: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        let pnl = self.net_pnl(entry, exit, 1);
        let cost = entry * (1.0 + self.buy_fee_rate);
        pnl / cost * 100.0
    }

    /// Price the position must reach so the fee-inclusive return equals `pct`.
    pub fn target_price(&self, entry: f64, pct: f64) -> f64 {
        entry * (1.0 + pct / 100.0) * (1.0 + self.buy_fee_rate)
            / (1.0 - self.sell_fee_rate - self.sell_tax_rate)
    }

    /// Price at which the fee-inclusive loss equals `pct`.
    pub fn stop_price(&self, entry: f64, pct: f64) -> f64 {
        entry * (1.0 - pct / 100.0) * (1.0 + self.buy_fee_rate)
            / (1.0 - self.sell_fee_rate - self.sell_tax_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_pnl_round_trip() {
        let fees = FeeSchedule::default();
        // entry 10,000 -> exit 10,300 x 100 shares
        let buy_amount = 10_000.0 * 100.0;
        let sell_amount = 10_300.0 * 100.0;
        let expected = (sell_amount - sell_amount * (0.000130527 + 0.002))
            - (buy_amount + buy_amount * 0.000140527);
        let got = fees.net_pnl(10_000.0, 10_300.0, 100);
        assert!((got - expected).abs() < 1e-9);
        // deterministic: same inputs, same output
        assert_eq!(got.to_bits(), fees.net_pnl(10_000.0, 10_300.0, 100).to_bits());
    }

    #[test]
    fn test_net_pnl_pct_sign() {
        let fees = FeeSchedule::default();
        // flat price is a small loss once fees and tax land
        assert!(fees.net_pnl_pct(10_000.0, 10_000.0) < 0.0);
        assert!(fees.net_pnl_pct(10_000.0, 10_300.0) > 0.0);
        assert!(fees.net_pnl_pct(10_000.0, 9_600.0) < -3.9);
    }

    #[test]
    fn test_target_and_stop_round_trip_through_pnl() {
        let fees = FeeSchedule::default();
        let target = fees.target_price(10_000.0, 3.0);
        assert!((fees.net_pnl_pct(10_000.0, target) - 3.0).abs() < 0.01);
        let stop = fees.stop_price(10_000.0, 4.0);
        assert!((fees.net_pnl_pct(10_000.0, stop) + 4.0).abs() < 0.01);
    }

    #[test]
    fn test_fee_split() {
        let fees = FeeSchedule::default();
        assert!((fees.buy_fee(1_000_000.0) - 140.527).abs() < 0.001);
        assert!((fees.sell_fee(1_000_000.0) - 2_130.527).abs() < 0.001);
    }
}
