//! Thread-safe registry of tradable instruments loaded from a TOML file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_core::{Price, Quantity, Side, Symbol};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static metadata for one spot market.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Market {
    pub symbol: Symbol,
    pub base: String,
    pub quote: String,
    #[serde(default)]
    pub tick_size: Option<Price>,
    #[serde(default)]
    pub lot_size: Option<Quantity>,
    #[serde(default)]
    pub min_notional: Option<Price>,
    #[serde(default = "default_tradable")]
    pub tradable: bool,
}

fn default_tradable() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no markets were loaded into the catalog")]
    Empty,
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(Symbol),
    #[error("market '{0}' is listed more than once")]
    Duplicate(Symbol),
    #[error("market '{symbol}' has a non-positive {field}")]
    InvalidField { symbol: Symbol, field: &'static str },
    #[error("markets file is invalid: {0}")]
    InvalidFormat(#[from] toml::de::Error),
    #[error("failed to read markets file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Deserialize)]
struct MarketFile {
    #[serde(default)]
    markets: Vec<Market>,
}

#[derive(Clone, Default)]
pub struct MarketCatalog {
    inner: Arc<RwLock<HashMap<Symbol, Market>>>,
}

impl MarketCatalog {
    pub fn from_markets(markets: Vec<Market>) -> Result<Self, CatalogError> {
        if markets.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut map = HashMap::with_capacity(markets.len());
        for mut market in markets {
            market.symbol = market.symbol.trim().to_ascii_uppercase();
            validate(&market)?;
            if map.contains_key(&market.symbol) {
                return Err(CatalogError::Duplicate(market.symbol));
            }
            map.insert(market.symbol.clone(), market);
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(map)),
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, CatalogError> {
        let file: MarketFile = toml::from_str(contents)?;
        Self::from_markets(file.markets)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn get(&self, symbol: &str) -> Option<Market> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Every market, sorted by symbol.
    pub fn markets(&self) -> Vec<Market> {
        let mut markets: Vec<_> = self.inner.read().values().cloned().collect();
        markets.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        markets
    }

    /// Symbols currently open for trading, sorted.
    pub fn tradable_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|market| market.tradable)
            .map(|market| market.symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn tick_sizes(&self) -> HashMap<Symbol, Price> {
        self.inner
            .read()
            .values()
            .filter_map(|market| market.tick_size.map(|tick| (market.symbol.clone(), tick)))
            .collect()
    }

    pub fn validate_symbols<I, S>(&self, symbols: I) -> Result<(), CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let map = self.inner.read();
        for symbol in symbols {
            let symbol = symbol.as_ref();
            if !map.contains_key(symbol) {
                return Err(CatalogError::UnknownSymbol(symbol.to_string()));
            }
        }
        Ok(())
    }

    /// Snap a limit price to the market's tick, never crossing further than requested.
    pub fn round_price(&self, symbol: &str, price: Price, side: Side) -> Price {
        let Some(tick) = self.get(symbol).and_then(|m| m.tick_size) else {
            return price;
        };
        let ticks = price / tick;
        let ticks = match side {
            Side::Buy => ticks.floor(),
            Side::Sell => ticks.ceil(),
        };
        (ticks * tick).normalize()
    }

    /// Round a quantity down to the lot size.
    pub fn round_quantity(&self, symbol: &str, quantity: Quantity) -> Quantity {
        match self.get(symbol).and_then(|m| m.lot_size) {
            Some(lot) => ((quantity / lot).floor() * lot).normalize(),
            None => quantity,
        }
    }

    /// Whether `notional` clears the market's minimum order value.
    pub fn meets_min_notional(&self, symbol: &str, notional: Price) -> Result<bool, CatalogError> {
        let market = self
            .get(symbol)
            .ok_or_else(|| CatalogError::UnknownSymbol(symbol.to_string()))?;
        Ok(market.min_notional.map_or(true, |min| notional >= min))
    }
}

fn validate(market: &Market) -> Result<(), CatalogError> {
    let checks = [
        ("tick_size", market.tick_size),
        ("lot_size", market.lot_size),
        ("min_notional", market.min_notional),
    ];
    for (field, value) in checks {
        if value.is_some_and(|v| v <= Decimal::ZERO) {
            return Err(CatalogError::InvalidField {
                symbol: market.symbol.clone(),
                field,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MARKETS: &str = r#"
        [[markets]]
        symbol = "xbtusd"
        base = "XBT"
        quote = "USD"
        tick_size = "0.1"
        lot_size = "0.0001"
        min_notional = "5"

        [[markets]]
        symbol = "ETHUSD"
        base = "ETH"
        quote = "USD"
        tick_size = "0.01"

        [[markets]]
        symbol = "LUNAUSD"
        base = "LUNA"
        quote = "USD"
        tradable = false
    "#;

    #[test]
    fn loads_and_normalizes_symbols() {
        let catalog = MarketCatalog::from_toml_str(MARKETS).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.tradable_symbols(), vec!["ETHUSD", "XBTUSD"]);
        assert_eq!(catalog.tick_sizes().get("XBTUSD"), Some(&dec!(0.1)));
        assert!(catalog.validate_symbols(["XBTUSD", "ETHUSD"]).is_ok());
        assert!(matches!(
            catalog.validate_symbols(["DOGEUSD"]),
            Err(CatalogError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn rounds_to_market_increments() {
        let catalog = MarketCatalog::from_toml_str(MARKETS).unwrap();
        assert_eq!(catalog.round_price("XBTUSD", dec!(100.17), Side::Buy), dec!(100.1));
        assert_eq!(catalog.round_price("XBTUSD", dec!(100.17), Side::Sell), dec!(100.2));
        assert_eq!(catalog.round_quantity("XBTUSD", dec!(0.123456)), dec!(0.1234));
        assert_eq!(catalog.round_price("LUNAUSD", dec!(1.2345), Side::Buy), dec!(1.2345));
        assert!(!catalog.meets_min_notional("XBTUSD", dec!(4.99)).unwrap());
        assert!(catalog.meets_min_notional("ETHUSD", dec!(0.01)).unwrap());
    }

    #[test]
    fn rejects_bad_files() {
        assert!(matches!(
            MarketCatalog::from_toml_str("markets = []"),
            Err(CatalogError::Empty)
        ));
        let dup = format!("{MARKETS}\n[[markets]]\nsymbol = \"XBTUSD\"\nbase = \"XBT\"\nquote = \"USD\"\n");
        assert!(matches!(
            MarketCatalog::from_toml_str(&dup),
            Err(CatalogError::Duplicate(_))
        ));
        let zero_tick = "[[markets]]\nsymbol = \"A\"\nbase = \"A\"\nquote = \"USD\"\ntick_size = \"0\"\n";
        assert!(matches!(
            MarketCatalog::from_toml_str(zero_tick),
            Err(CatalogError::InvalidField { field: "tick_size", .. })
        ));
        assert!(matches!(
            MarketCatalog::load_from_file("/nonexistent/markets.toml"),
            Err(CatalogError::Io { .. })
        ));
    }
}
