//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。Clock から timestamp 部分を作る

use crate::domain::ids::EventId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は Event ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（worker スレッドからも参照されるため）
pub trait IdGenerator: Send + Sync {
    fn generate_event_id(&self) -> EventId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// テスト時に FixedClock を渡すと timestamp 部分が固定されます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_event_id(&self) -> EventId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        EventId::from(ulid)
    }
}
