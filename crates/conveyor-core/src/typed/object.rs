//! ObjectType trait - 型付きペイロードの定義
//!
//! メッセージのペイロードや flow の状態フィールドには任意の型を埋め込めます。
//! 埋め込まれたオブジェクトは `type_name` タグ付きのバイト列として保存され、
//! 起動時に構築する `TypeRegistry` で型名を解決します。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// ObjectType は型名と Rust の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ListDirectory {
///     path: String,
/// }
///
/// impl ObjectType for ListDirectory {
///     const TYPE: &'static str = "conveyor.list_directory.v1";
/// }
/// ```
///
/// # 命名規約
/// - `{namespace}.{name}.v{major}`
/// - 互換性のない変更をしたら major を上げ、旧バージョンも登録しておく
pub trait ObjectType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
