use super::agent::AgentStats;
use super::config::*;

/// Attributes that can be traded against currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Power,
    Health,
    Range,
}

/// Exchange between currency and attributes, bound to one agent's working
/// stats for the duration of a decision call.
pub struct Shop<'a> {
    stats: &'a mut AgentStats,
    rates: &'a ExchangeRates,
}

impl<'a> Shop<'a> {
    pub fn new(stats: &'a mut AgentStats, rates: &'a ExchangeRates) -> Self {
        Shop { stats, rates }
    }

    fn rate(&self, attr: Attribute) -> i32 {
        match attr {
            Attribute::Power => self.rates.power,
            Attribute::Health => self.rates.health,
            Attribute::Range => self.rates.range,
        }
    }

    fn level(&self, attr: Attribute) -> i32 {
        match attr {
            Attribute::Power => self.stats.power(),
            Attribute::Health => self.stats.health(),
            Attribute::Range => self.stats.range(),
        }
    }

    fn set_level(&mut self, attr: Attribute, v: i32) {
        match attr {
            Attribute::Power => self.stats.set_power(v),
            Attribute::Health => self.stats.set_health(v),
            Attribute::Range => self.stats.set_range(v),
        }
    }

    /// Lowest value the attribute may be left at after a sale.
    fn sale_floor(attr: Attribute) -> i32 {
        match attr {
            Attribute::Power => MIN_POWER,
            // a sale must never eliminate
            Attribute::Health => MIN_HEALTH + 1,
            Attribute::Range => MIN_RANGE,
        }
    }

    fn ceiling(attr: Attribute) -> i32 {
        match attr {
            Attribute::Power => MAX_POWER,
            Attribute::Health => MAX_HEALTH,
            Attribute::Range => MAX_RANGE,
        }
    }

    /// Buy one point of `attr`. Returns false (no change) when the agent
    /// cannot afford it or the attribute is already at its ceiling.
    pub fn buy(&mut self, attr: Attribute) -> bool {
        let cost = self.rate(attr);
        let level = self.level(attr);
        if self.stats.currency() < cost || level >= Self::ceiling(attr) {
            return false;
        }
        self.stats.set_currency(self.stats.currency() - cost);
        self.set_level(attr, level + 1);
        true
    }

    /// Sell one point of `attr` for its rate in currency.
    pub fn sell(&mut self, attr: Attribute) -> bool {
        let level = self.level(attr);
        if level - 1 < Self::sale_floor(attr) {
            return false;
        }
        self.set_level(attr, level - 1);
        self.stats.set_currency(self.stats.currency() + self.rate(attr));
        true
    }

    pub fn buy_power(&mut self) -> bool {
        self.buy(Attribute::Power)
    }

    pub fn buy_health(&mut self) -> bool {
        self.buy(Attribute::Health)
    }

    pub fn buy_range(&mut self) -> bool {
        self.buy(Attribute::Range)
    }

    pub fn sell_power(&mut self) -> bool {
        self.sell(Attribute::Power)
    }

    pub fn sell_health(&mut self) -> bool {
        self.sell(Attribute::Health)
    }

    pub fn sell_range(&mut self) -> bool {
        self.sell(Attribute::Range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_power_unaffordable() {
        let mut stats = AgentStats::new(10, 1, 2, 1);
        let rates = ExchangeRates::default();
        let mut shop = Shop::new(&mut stats, &rates);
        assert!(!shop.buy_power());
        assert_eq!(stats, AgentStats::new(10, 1, 2, 1));
    }

    #[test]
    fn test_buy_each_attribute() {
        let mut stats = AgentStats::new(10, 1, 9, 1);
        let rates = ExchangeRates::default();
        let mut shop = Shop::new(&mut stats, &rates);
        assert!(shop.buy_power()); // 9 - 3
        assert!(shop.buy_health()); // 6 - 2
        assert!(shop.buy_range()); // 4 - 4
        assert!(!shop.buy_health());
        assert_eq!(stats, AgentStats::new(11, 2, 0, 2));
    }

    #[test]
    fn test_buy_at_ceiling() {
        let mut stats = AgentStats::new(10, MAX_POWER, 100, 1);
        let rates = ExchangeRates::default();
        assert!(!Shop::new(&mut stats, &rates).buy_power());
        assert_eq!(stats.currency(), 100);
    }

    #[test]
    fn test_sell_respects_floor() {
        let mut stats = AgentStats::new(10, 1, 0, 1);
        let rates = ExchangeRates::default();
        let mut shop = Shop::new(&mut stats, &rates);
        assert!(!shop.sell_power());
        assert!(!shop.sell_range());
        assert_eq!(stats.currency(), 0);
    }

    #[test]
    fn test_sell_health_never_eliminates() {
        let mut stats = AgentStats::new(2, 1, 0, 1);
        let rates = ExchangeRates::default();
        let mut shop = Shop::new(&mut stats, &rates);
        assert!(shop.sell_health());
        assert!(!shop.sell_health());
        assert_eq!(stats.health(), 1);
        assert_eq!(stats.currency(), 2);
    }

    #[test]
    fn test_sell_refund_clamped() {
        let mut stats = AgentStats::new(10, 5, MAX_CURRENCY - 1, 1);
        let rates = ExchangeRates::default();
        assert!(Shop::new(&mut stats, &rates).sell_power());
        assert_eq!(stats.power(), 4);
        assert_eq!(stats.currency(), MAX_CURRENCY);
    }
}
