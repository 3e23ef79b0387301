//! Synchronous DDL execution: plan descriptors to engine descriptors.

use std::sync::Arc;

use strato_common::{ColumnType, DataType, StratoError, StratoResult};

use crate::engine::{Attribute, CompressAlg, DefaultValue, Engine, Property, TableDef};
use crate::plan::{ColDef, CompressType, DdlPlan, TableDefItem};
use crate::scope::Scope;

/// Translates wire-format column definitions to engine attributes.
pub fn plan_cols_to_defs(cols: &[ColDef]) -> StratoResult<Vec<TableDef>> {
    cols.iter()
        .map(|col| {
            let data_type = DataType::from_tag(col.typ.id).ok_or_else(|| {
                StratoError::plan(format!(
                    "column '{}' has unknown type tag {}",
                    col.name, col.typ.id
                ))
            })?;
            let column_type = ColumnType {
                data_type,
                width: col.typ.width,
                precision: col.typ.precision,
                scale: col.typ.scale,
                size: col.typ.size,
            };
            Ok(TableDef::Attribute(Attribute {
                name: col.name.clone(),
                alg: match col.alg {
                    CompressType::None => CompressAlg::None,
                    CompressType::Lz4 => CompressAlg::Lz4,
                },
                column_type,
                default: DefaultValue {
                    exist: col.default.exist,
                    value: col.default.value.clone(),
                    is_null: col.default.is_null,
                },
                primary: col.primary,
            }))
        })
        .collect()
}

/// Translates wire-format table-level definitions to engine descriptors.
pub fn plan_defs_to_defs(defs: &[TableDefItem]) -> Vec<TableDef> {
    defs.iter()
        .map(|def| match def {
            TableDefItem::PrimaryIndex { names } => TableDef::PrimaryIndex {
                names: names.clone(),
            },
            TableDefItem::Index { col_names, name } => TableDef::Index {
                col_names: col_names.clone(),
                name: name.clone(),
            },
            TableDefItem::Properties { properties } => TableDef::Properties {
                properties: properties
                    .iter()
                    .map(|p| Property {
                        key: p.key.clone(),
                        value: p.value.clone(),
                    })
                    .collect(),
            },
        })
        .collect()
}

impl Scope {
    fn ddl_plan(&self) -> StratoResult<&DdlPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| StratoError::plan("scope carries no DDL descriptor"))
    }

    /// CREATE DATABASE.
    pub async fn create_database(&self, engine: &Arc<dyn Engine>) -> StratoResult<()> {
        let DdlPlan::CreateDatabase { database } = self.ddl_plan()? else {
            return Err(StratoError::plan("expected a CREATE DATABASE descriptor"));
        };
        engine
            .create_database(self.proc.timestamp, database, self.proc.snapshot)
            .await
    }

    /// DROP DATABASE.
    pub async fn drop_database(&self, engine: &Arc<dyn Engine>) -> StratoResult<()> {
        let DdlPlan::DropDatabase { database } = self.ddl_plan()? else {
            return Err(StratoError::plan("expected a DROP DATABASE descriptor"));
        };
        engine
            .delete_database(self.proc.timestamp, database, self.proc.snapshot)
            .await
    }

    /// CREATE TABLE: column attributes first, table-level definitions
    /// after, exactly the order the engine contract expects.
    pub async fn create_table(
        &self,
        engine: &Arc<dyn Engine>,
        default_db: &str,
    ) -> StratoResult<()> {
        let DdlPlan::CreateTable { database, table } = self.ddl_plan()? else {
            return Err(StratoError::plan("expected a CREATE TABLE descriptor"));
        };
        let mut defs = plan_cols_to_defs(&table.cols)?;
        defs.extend(plan_defs_to_defs(&table.defs));

        let db_name = if database.is_empty() {
            default_db
        } else {
            database
        };
        let db = engine.database(db_name, self.proc.snapshot).await?;
        db.create_table(self.proc.timestamp, &table.name, defs, self.proc.snapshot)
            .await
    }

    /// DROP TABLE.
    pub async fn drop_table(&self, engine: &Arc<dyn Engine>) -> StratoResult<()> {
        let DdlPlan::DropTable { database, table } = self.ddl_plan()? else {
            return Err(StratoError::plan("expected a DROP TABLE descriptor"));
        };
        let db = engine.database(database, self.proc.snapshot).await?;
        db.delete_table(self.proc.timestamp, table, self.proc.snapshot)
            .await
    }

    /// CREATE INDEX. Index maintenance happens below this layer; the
    /// operation is accepted and recorded nowhere.
    pub async fn create_index(&self, _engine: &Arc<dyn Engine>) -> StratoResult<()> {
        Ok(())
    }

    /// DROP INDEX. See [`Scope::create_index`].
    pub async fn drop_index(&self, _engine: &Arc<dyn Engine>) -> StratoResult<()> {
        Ok(())
    }
}
