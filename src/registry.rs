//! 合约注册表模块
//!
//! 本模块维护每个品种的静态/衍生元数据，并对外提供价格取整与合约解析查询。
//!
//! # 核心概念
//!
//! - **Instrument**: 品种元数据（最小变动价位、合约乘数、保证金率、涨跌停比例、
//!   当前/前一主力合约、夜盘标志）
//! - **ContractRegistry**: 以品种代码为键的注册表，是本核心唯一的合约元数据来源
//! - **RolloverEvent**: 主力合约切换事件，交易所报告的主力合约与缓存值不一致时触发
//!
//! # 不变量
//!
//! - `price_tick > 0`，在加载时校验，违反即为致命配置错误
//! - `main_code` 只通过显式的切换事件变更，从不静默改写
//! - 对相同观测值重复调用 [`ContractRegistry::detect_rollover`] 是幂等的：
//!   第二次相同观测不再产生事件

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::info;

/// 国内商品/金融期货交易所。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum Exchange {
    /// 上海期货交易所。
    Shfe,
    /// 大连商品交易所。
    Dce,
    /// 郑州商品交易所。
    Czce,
    /// 中国金融期货交易所。
    Cffex,
    /// 广州期货交易所。
    Gfex,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Exchange::Shfe => "SHFE",
            Exchange::Dce => "DCE",
            Exchange::Czce => "CZCE",
            Exchange::Cffex => "CFFEX",
            Exchange::Gfex => "GFEX",
        };
        write!(f, "{name}")
    }
}

/// 品种元数据。
///
/// 由外部数据同步方写入（通过 [`Store`](crate::store::Store) 加载），本核心视角下
/// 只读——唯一例外是主力/前主力字段，核心在检测到主力切换事件时更新它们。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Instrument {
    /// 品种代码（如 `rb`、`cu`）。
    pub code: SmolStr,
    /// 所属交易所。
    pub exchange: Exchange,
    /// 品种名称。
    pub name: String,
    /// 最小变动价位，必须为正。
    pub price_tick: Decimal,
    /// 合约乘数（每手吨数/点值）。
    pub volume_multiple: Decimal,
    /// 保证金率（名义价值的比例）。
    pub margin_rate: Decimal,
    /// 涨停比例（相对参考价）。
    pub up_limit_ratio: Decimal,
    /// 跌停比例（相对参考价）。
    pub down_limit_ratio: Decimal,
    /// 当前主力合约代码（如 `rb2410`）。
    pub main_code: SmolStr,
    /// 前一主力合约代码。
    pub last_main_code: Option<SmolStr>,
    /// 最近一次主力切换时间。
    pub main_switch_time: Option<DateTime<Utc>>,
    /// 是否有夜盘交易时段。
    pub night_trade: bool,
}

impl Instrument {
    /// 校验元数据不变量。
    ///
    /// `price_tick`、`volume_multiple`、`margin_rate` 必须为正，涨跌停比例必须非负。
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.price_tick <= Decimal::ZERO {
            return Err(RegistryError::InvalidInstrument {
                code: self.code.clone(),
                reason: format!("price_tick {} must be positive", self.price_tick),
            });
        }
        if self.volume_multiple <= Decimal::ZERO {
            return Err(RegistryError::InvalidInstrument {
                code: self.code.clone(),
                reason: format!("volume_multiple {} must be positive", self.volume_multiple),
            });
        }
        if self.margin_rate <= Decimal::ZERO {
            return Err(RegistryError::InvalidInstrument {
                code: self.code.clone(),
                reason: format!("margin_rate {} must be positive", self.margin_rate),
            });
        }
        if self.up_limit_ratio < Decimal::ZERO || self.down_limit_ratio < Decimal::ZERO {
            return Err(RegistryError::InvalidInstrument {
                code: self.code.clone(),
                reason: "price limit ratios must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

/// 主力合约切换事件。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct RolloverEvent {
    /// 品种代码。
    pub product: SmolStr,
    /// 切出的旧主力合约。
    pub old_main: SmolStr,
    /// 切入的新主力合约。
    pub new_main: SmolStr,
    /// 切换记录时间。
    pub time: DateTime<Utc>,
}

/// 注册表错误。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum RegistryError {
    /// 请求的品种不存在。
    #[error("unknown instrument: {0}")]
    UnknownInstrument(SmolStr),

    /// 元数据不变量被违反。
    #[error("invalid instrument {code}: {reason}")]
    InvalidInstrument {
        /// 品种代码。
        code: SmolStr,
        /// 违反原因。
        reason: String,
    },
}

/// 从合约代码提取品种代码。
///
/// 合约代码为品种代码加交割月，如 `rb2410` -> `rb`、`MA501` -> `MA`。
pub fn product_of(contract: &str) -> SmolStr {
    let prefix_len = contract
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(contract.len());
    SmolStr::new(&contract[..prefix_len])
}

/// 品种元数据注册表。
///
/// 持有所有已加载品种，提供解析、价格取整与主力切换检测。除主力字段外只读。
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    instruments: FnvHashMap<SmolStr, Instrument>,
    ignored: Vec<SmolStr>,
}

impl ContractRegistry {
    /// 从品种列表构造注册表，逐一校验不变量。
    ///
    /// 任何品种校验失败都使整个构造失败——元数据不可信时不允许交易。
    pub fn new(
        instruments: impl IntoIterator<Item = Instrument>,
        ignored: impl IntoIterator<Item = SmolStr>,
    ) -> Result<Self, RegistryError> {
        let mut map = FnvHashMap::default();
        for instrument in instruments {
            instrument.validate()?;
            map.insert(instrument.code.clone(), instrument);
        }
        Ok(Self {
            instruments: map,
            ignored: ignored.into_iter().collect(),
        })
    }

    /// 已加载的品种数量。
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// 注册表是否为空。
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// 品种是否在忽略清单内。
    ///
    /// 被忽略的品种不会产生任何信号，对应行情直接丢弃。
    pub fn is_ignored(&self, product: &str) -> bool {
        self.ignored.iter().any(|code| code == product)
    }

    /// 按品种代码解析元数据。
    pub fn resolve(&self, product: &str) -> Result<&Instrument, RegistryError> {
        self.instruments
            .get(product)
            .ok_or_else(|| RegistryError::UnknownInstrument(SmolStr::new(product)))
    }

    /// 按合约代码解析品种元数据（先剥离交割月）。
    pub fn resolve_contract(&self, contract: &str) -> Result<&Instrument, RegistryError> {
        self.resolve(product_of(contract).as_str())
    }

    /// 遍历全部品种。
    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }

    /// 插入或替换一个品种（数据同步刷新用），仍然先校验不变量。
    pub fn upsert(&mut self, instrument: Instrument) -> Result<(), RegistryError> {
        instrument.validate()?;
        self.instruments.insert(instrument.code.clone(), instrument);
        Ok(())
    }

    /// 将原始价格取整到品种最小变动价位的整数倍。
    ///
    /// 采用精确十进制的四舍五入（round-half-up）语义，保证幂等：
    /// 对任意 x 都有 `round_price(x) == round_price(round_price(x))`。
    pub fn round_price(instrument: &Instrument, raw: Decimal) -> Decimal {
        let ticks = (raw / instrument.price_tick)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        ticks * instrument.price_tick
    }

    /// 检测主力合约切换。
    ///
    /// 当交易所报告的主力合约与缓存值不一致时返回切换事件，同时把旧主力移入
    /// `last_main_code`、记录切换时间并更新缓存。相同观测值重复调用不再产生事件。
    pub fn detect_rollover(
        &mut self,
        product: &str,
        observed_main: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RolloverEvent>, RegistryError> {
        let instrument = self
            .instruments
            .get_mut(product)
            .ok_or_else(|| RegistryError::UnknownInstrument(SmolStr::new(product)))?;

        if instrument.main_code.as_str() == observed_main {
            return Ok(None);
        }

        let old_main = instrument.main_code.clone();
        let new_main = SmolStr::new(observed_main);

        instrument.last_main_code = Some(old_main.clone());
        instrument.main_code = new_main.clone();
        instrument.main_switch_time = Some(now);

        info!(
            product = %instrument.code,
            %old_main,
            %new_main,
            "main contract rollover detected"
        );

        Ok(Some(RolloverEvent {
            product: instrument.code.clone(),
            old_main,
            new_main,
            time: now,
        }))
    }
}
