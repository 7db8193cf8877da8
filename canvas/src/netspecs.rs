use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::common::{Range, MAX_CHECK_RATIO, MIN_CHECK_RATIO};
use crate::expr::{DynamicFills, StaticSpecs};
use crate::utils::{factors, gcd};

/// One convolution layer of the reference network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LayerSpecs {
    pub ic: u64,
    pub oc: u64,
    pub k: u64,
    pub s: u64,
    pub h: u64,
    pub w: u64,
}

/// Global values for static variables which no layer determines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct HeuristicPreferences {
    pub g: u64,
    pub r: u64,
}

/// A reference network: its layers and the FLOPs and parameter budgets derived from them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NetSpecs {
    pub layers: Vec<LayerSpecs>,
    pub flops_ratio_range: Range<f64>,
    pub ps_ratio_range: Range<f64>,
    pub standard_conv_flops: u64,
    pub standard_conv_ps: u64,
    pub flops_range: Range<u64>,
    pub ps_range: Range<u64>,
    /// The GCD of the smaller channel count of every layer.
    pub c_gcd: u64,
    /// Every factor of `c_gcd` greater than one.
    pub c_gcd_factors: Vec<u64>,
    /// Whether every layer is a 1x1 convolution.
    pub no_neighbor_involved: bool,
}

/// One [DynamicFills] per layer of a [NetSpecs].
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetFills(pub Vec<DynamicFills>);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NetSpecsError {
    #[error("Expected {0}, but the input ended")]
    MissingToken(&'static str),
    #[error("Could not parse {token:?} as {what}")]
    BadNumber { token: String, what: &'static str },
    #[error("Ratio {0} is outside of [{}, {}]", MIN_CHECK_RATIO, MAX_CHECK_RATIO)]
    RatioOutOfBounds(f64),
    #[error("The {what} range [{min}, {max}] is empty")]
    EmptyRange {
        what: &'static str,
        min: f64,
        max: f64,
    },
    #[error("Illegal number of layers: {0}")]
    LayerCount(i64),
    #[error("Expected {expected} layers, but found {found} values after the layer count")]
    LayerCountMismatch { expected: usize, found: usize },
    #[error("Layer {layer}: {field} must be positive, but is {value}")]
    NonPositive {
        layer: usize,
        field: &'static str,
        value: i64,
    },
    #[error("Layer {layer}: height and width ({h}, {w}) must be divisible by stride {s}")]
    StrideNotDividing {
        layer: usize,
        h: u64,
        w: u64,
        s: u64,
    },
    #[error("Layer {layer}: channel counts {ic} and {oc} must divide one another")]
    ChannelGcd { layer: usize, ic: u64, oc: u64 },
    #[error("Standard convolution cost overflows")]
    Overflow,
}

const LAYER_FIELDS: [&str; 6] = ["ic", "oc", "k", "s", "h", "w"];

impl LayerSpecs {
    pub fn out_h(&self) -> u64 {
        self.h / self.s
    }

    pub fn out_w(&self) -> u64 {
        self.w / self.s
    }

    pub fn standard_conv_ps(&self) -> Option<u64> {
        self.ic
            .checked_mul(self.k)?
            .checked_mul(self.k)?
            .checked_mul(self.oc)
    }

    /// Multiply-adds of a dense convolution, counted as two FLOPs each.
    pub fn standard_conv_flops(&self) -> Option<u64> {
        self.standard_conv_ps()?
            .checked_mul(self.out_h())?
            .checked_mul(self.out_w())?
            .checked_mul(2)
    }
}

impl Default for HeuristicPreferences {
    fn default() -> Self {
        HeuristicPreferences { g: 2, r: 2 }
    }
}

/// The static specs a kernel sees when it replaces `layer`.
pub fn merge_into_static_specs(
    preferences: &HeuristicPreferences,
    layer: &LayerSpecs,
) -> StaticSpecs {
    StaticSpecs {
        g: preferences.g,
        r: preferences.r,
        c: layer.oc,
        h: layer.out_h(),
        w: layer.out_w(),
    }
}

impl NetSpecs {
    /// Parses `flops_min, flops_max, ps_min, ps_max, [N, [ic, oc, k, s, h, w]*N]`.
    ///
    /// Brackets and commas are interchangeable separators.
    pub fn parse(s: &str) -> Result<Self, NetSpecsError> {
        let mut tokens = s
            .split(|c: char| c == ',' || c == '[' || c == ']' || c.is_whitespace())
            .filter(|t| !t.is_empty());
        let mut ratio = |what| -> Result<f64, NetSpecsError> {
            let token = tokens.next().ok_or(NetSpecsError::MissingToken(what))?;
            let value = token.parse::<f64>().map_err(|_| NetSpecsError::BadNumber {
                token: token.to_string(),
                what,
            })?;
            if !(MIN_CHECK_RATIO..=MAX_CHECK_RATIO).contains(&value) {
                return Err(NetSpecsError::RatioOutOfBounds(value));
            }
            Ok(value)
        };
        let flops_ratio_range = Range::new(ratio("FLOPs ratio")?, ratio("FLOPs ratio")?);
        let ps_ratio_range = Range::new(ratio("params ratio")?, ratio("params ratio")?);
        for (what, range) in [
            ("FLOPs ratio", flops_ratio_range),
            ("params ratio", ps_ratio_range),
        ] {
            if range.min >= range.max {
                return Err(NetSpecsError::EmptyRange {
                    what,
                    min: range.min,
                    max: range.max,
                });
            }
        }

        let count_token = tokens
            .next()
            .ok_or(NetSpecsError::MissingToken("layer count"))?;
        let count = parse_int(count_token, "layer count")?;
        let expected_values = usize::try_from(count)
            .ok()
            .filter(|&c| c > 0)
            .and_then(|c| c.checked_mul(LAYER_FIELDS.len()))
            .ok_or(NetSpecsError::LayerCount(count))?;
        let count = expected_values / LAYER_FIELDS.len();
        let values = tokens
            .map(|t| parse_int(t, "layer dimension"))
            .collect::<Result<Vec<_>, _>>()?;
        if values.len() != expected_values {
            return Err(NetSpecsError::LayerCountMismatch {
                expected: count,
                found: values.len(),
            });
        }

        let mut layers = Vec::with_capacity(count);
        for (layer, chunk) in values.chunks_exact(LAYER_FIELDS.len()).enumerate() {
            let mut dims = [0u64; 6];
            for ((dim, &value), field) in dims.iter_mut().zip(chunk).zip(LAYER_FIELDS) {
                if value <= 0 {
                    return Err(NetSpecsError::NonPositive {
                        layer,
                        field,
                        value,
                    });
                }
                *dim = value as u64;
            }
            let [ic, oc, k, s, h, w] = dims;
            if h % s != 0 || w % s != 0 {
                return Err(NetSpecsError::StrideNotDividing { layer, h, w, s });
            }
            if gcd(ic, oc) != ic.min(oc) {
                return Err(NetSpecsError::ChannelGcd { layer, ic, oc });
            }
            layers.push(LayerSpecs { ic, oc, k, s, h, w });
        }
        Self::from_layers(layers, flops_ratio_range, ps_ratio_range)
    }

    /// Derives budgets from already-validated layers.
    pub fn from_layers(
        layers: Vec<LayerSpecs>,
        flops_ratio_range: Range<f64>,
        ps_ratio_range: Range<f64>,
    ) -> Result<Self, NetSpecsError> {
        let mut standard_conv_flops = 0u64;
        let mut standard_conv_ps = 0u64;
        for layer in &layers {
            standard_conv_flops = layer
                .standard_conv_flops()
                .and_then(|f| standard_conv_flops.checked_add(f))
                .ok_or(NetSpecsError::Overflow)?;
            standard_conv_ps = layer
                .standard_conv_ps()
                .and_then(|p| standard_conv_ps.checked_add(p))
                .ok_or(NetSpecsError::Overflow)?;
        }
        let scale = |base: u64, ratios: Range<f64>| {
            Range::new(
                (base as f64 * ratios.min) as u64,
                (base as f64 * ratios.max) as u64,
            )
        };
        let c_gcd = layers
            .iter()
            .map(|l| l.ic.min(l.oc))
            .reduce(gcd)
            .unwrap_or(1);
        let flops_range = scale(standard_conv_flops, flops_ratio_range);
        let ps_range = scale(standard_conv_ps, ps_ratio_range);
        for (what, range) in [("FLOPs", flops_range), ("params", ps_range)] {
            if range.min >= range.max {
                return Err(NetSpecsError::EmptyRange {
                    what,
                    min: range.min as f64,
                    max: range.max as f64,
                });
            }
        }
        let net = NetSpecs {
            flops_range,
            ps_range,
            no_neighbor_involved: layers.iter().all(|l| l.k == 1),
            c_gcd_factors: factors(c_gcd).into_iter().filter(|&f| f >= 2).collect(),
            c_gcd,
            layers,
            flops_ratio_range,
            ps_ratio_range,
            standard_conv_flops,
            standard_conv_ps,
        };
        log::debug!(
            "Parsed {} layers: FLOPs range {}, params range {}",
            net.layers.len(),
            net.flops_range,
            net.ps_range
        );
        Ok(net)
    }

    /// The static specs of every layer, in order.
    pub fn layer_static_specs(&self, preferences: &HeuristicPreferences) -> Vec<StaticSpecs> {
        self.layers
            .iter()
            .map(|l| merge_into_static_specs(preferences, l))
            .collect()
    }
}

fn parse_int(token: &str, what: &'static str) -> Result<i64, NetSpecsError> {
    token.parse::<i64>().map_err(|_| NetSpecsError::BadNumber {
        token: token.to_string(),
        what,
    })
}

impl FromStr for NetSpecs {
    type Err = NetSpecsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetSpecs::parse(s)
    }
}

impl Display for NetSpecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NetSpecs:")?;
        writeln!(
            f,
            " > Standard convolution FLOPs: {}",
            self.standard_conv_flops
        )?;
        writeln!(
            f,
            " > Standard convolution params: {}",
            self.standard_conv_ps
        )?;
        writeln!(f, " > FLOPs ratio range: {}", self.flops_ratio_range)?;
        writeln!(f, " > Params ratio range: {}", self.ps_ratio_range)?;
        writeln!(f, " > FLOPs range: {}", self.flops_range)?;
        writeln!(f, " > Params range: {}", self.ps_range)?;
        write!(f, " > Number of layers: {}", self.layers.len())?;
        for (i, l) in self.layers.iter().enumerate() {
            write!(
                f,
                "\n   > Layer#{i}: {}, {}, {}, {}, {}, {}",
                l.ic, l.oc, l.k, l.s, l.h, l.w
            )?;
        }
        Ok(())
    }
}

impl NetFills {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, layer: usize) -> Option<&DynamicFills> {
        self.0.get(layer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DynamicFills> + '_ {
        self.0.iter()
    }
}

impl Display for NetFills {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "NetFills (0 layers): null");
        }
        let layers = self.0.iter().map(|d| d.to_string()).collect::<Vec<_>>();
        write!(
            f,
            "NetFills ({} layers): {}",
            self.0.len(),
            layers.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_LAYERS: &str = "0.1, 1.0, 0.1, 1.0, [2, [4,4,3,1,8,8],[4,4,3,1,8,8]]";

    #[test]
    fn test_parse_two_layers() {
        let net: NetSpecs = TWO_LAYERS.parse().unwrap();
        assert_eq!(net.layers.len(), 2);
        assert_eq!(net.standard_conv_flops, 2 * (4 * 3 * 3 * 4 * 8 * 8 * 2));
        assert_eq!(net.standard_conv_ps, 2 * (4 * 3 * 3 * 4));
        assert_eq!(net.flops_range, Range::new(3686, 36864));
        assert_eq!(net.ps_range, Range::new(28, 288));
        assert_eq!(net.c_gcd, 4);
        assert_eq!(net.c_gcd_factors, vec![2, 4]);
        assert!(!net.no_neighbor_involved);
    }

    #[test]
    fn test_layer_static_specs() {
        let line = "0.5, 2, 0.5, 2, [2, [32, 64, 1, 2, 16, 8], [64, 64, 1, 1, 8, 4]]";
        let net = NetSpecs::parse(line).unwrap();
        assert!(net.no_neighbor_involved);
        assert_eq!(net.c_gcd, 32);
        let specs = net.layer_static_specs(&HeuristicPreferences { g: 4, r: 8 });
        assert_eq!(
            specs[0],
            StaticSpecs {
                g: 4,
                r: 8,
                c: 64,
                h: 8,
                w: 4
            }
        );
        assert_eq!(specs[1].h, 8);
    }

    #[test]
    fn test_rejects_insane_ratios() {
        for line in [
            "1e-9, 1.0, 0.1, 1.0, [1, [4,4,3,1,8,8]]",
            "0.1, 1e9, 0.1, 1.0, [1, [4,4,3,1,8,8]]",
        ] {
            assert!(matches!(
                NetSpecs::parse(line),
                Err(NetSpecsError::RatioOutOfBounds(_))
            ));
        }
        assert!(NetSpecs::parse("1e-4, 1e4, 1e-4, 1e4, [1, [4,4,3,1,8,8]]").is_ok());
    }

    #[test]
    fn test_rejects_malformed_layers() {
        assert!(matches!(
            NetSpecs::parse("1.0, 0.1, 0.1, 1.0, [1, [4,4,3,1,8,8]]"),
            Err(NetSpecsError::EmptyRange { .. })
        ));
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [0]"),
            Err(NetSpecsError::LayerCount(0))
        );
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [2, [4,4,3,1,8,8]]"),
            Err(NetSpecsError::LayerCountMismatch {
                expected: 2,
                found: 6
            })
        );
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [1, [4,4,3,2,9,8]]"),
            Err(NetSpecsError::StrideNotDividing {
                layer: 0,
                h: 9,
                w: 8,
                s: 2
            })
        );
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [1, [4,6,3,1,8,8]]"),
            Err(NetSpecsError::ChannelGcd {
                layer: 0,
                ic: 4,
                oc: 6
            })
        );
        assert!(matches!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [1, [4,0,3,1,8,8]]"),
            Err(NetSpecsError::NonPositive { field: "oc", .. })
        ));
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [9223372036854775807, [4,4,3,1,8,8]]"),
            Err(NetSpecsError::LayerCount(i64::MAX))
        );
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [-3, [4,4,3,1,8,8]]"),
            Err(NetSpecsError::LayerCount(-3))
        );
        assert!(matches!(
            NetSpecs::parse("0.1, 1.0, 0.1"),
            Err(NetSpecsError::MissingToken(_))
        ));
    }

    #[test]
    fn test_rejects_budgets_truncated_to_nothing() {
        // A 1x1 layer on one pixel costs one parameter and two FLOPs.
        assert_eq!(
            NetSpecs::parse("0.5, 0.9, 0.1, 1.0, [1, [1,1,1,1,1,1]]"),
            Err(NetSpecsError::EmptyRange {
                what: "FLOPs",
                min: 1.0,
                max: 1.0
            })
        );
        assert_eq!(
            NetSpecs::parse("0.1, 1.0, 0.5, 0.9, [1, [1,1,1,1,1,1]]"),
            Err(NetSpecsError::EmptyRange {
                what: "params",
                min: 0.0,
                max: 0.0
            })
        );
        assert!(NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [1, [1,1,1,1,1,1]]").is_ok());
    }

    #[test]
    fn test_display_lists_layers() {
        let net: NetSpecs = TWO_LAYERS.parse().unwrap();
        let shown = net.to_string();
        assert!(shown.contains("FLOPs range: [3686, 36864]"));
        assert!(shown.contains("Layer#1: 4, 4, 3, 1, 8, 8"));
    }
}
