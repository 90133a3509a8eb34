//! Canonical entity kinds, output table names and column names.
//!
//! Column names here are already in canonical form (see
//! [`crate::table::canonical_name`]); the index must rename source columns to
//! these names for enrichment and joins to find them.

use crate::table::canonical_name;

pub mod col {
    pub const PATIENT_ID: &str = "paciente_id";
    pub const BIRTH_DATE: &str = "fecha_nacimiento";
    pub const SEX: &str = "sexo";
    pub const BRANCH_ID: &str = "sucursal_id";
    pub const PATIENT_TYPE_ID: &str = "tipo_paciente_id";
    pub const CIVIL_STATUS: &str = "estado_civil";
    pub const AGE: &str = "edad";
    pub const ORIGIN_CATEGORY: &str = "categoria_origen";

    pub const APPOINTMENT_ID: &str = "cita_id";
    pub const APPOINTMENT_DATE: &str = "fecha_cita";
    pub const ATTENDED: &str = "asistio";
    pub const DUPLICATE: &str = "duplicada";
    pub const CREATION_DATE: &str = "fecha_creacion";
    pub const TREATMENT_ID: &str = "tratamiento_id";
    pub const START_TIME: &str = "hora_inicio";
    pub const END_TIME: &str = "hora_fin";
    pub const FIRST_ATTENDED_DATE: &str = "fecha_primera_atencion";
    pub const VISIT_LABEL: &str = "etiqueta_visita";
    pub const DURATION_MINUTES: &str = "duracion_minutos";

    pub const BUDGET_DETAIL_ID: &str = "detalle_presupuesto_id";
    pub const PROCEDURE_ID: &str = "prestacion_id";
    pub const ORIGINAL_PRICE: &str = "precio_original";
    pub const PATIENT_PRICE: &str = "precio_paciente";
    pub const DISCOUNT_AMOUNT: &str = "monto_descuento";

    pub const PAYMENT_ID: &str = "pago_id";
    pub const PAYMENT_METHOD: &str = "medio_pago";
    pub const AMOUNT_PAID: &str = "monto_pagado";
    pub const AMOUNT_RETURNED: &str = "monto_devuelto";
    pub const AMOUNT_APPLIED: &str = "monto_abonado";
    pub const PAYMENT_LINES: &str = "lineas_pago";
    pub const LINE_NUMBER: &str = "linea";

    pub const EXPENSE_ID: &str = "gasto_id";
}

pub mod tables {
    pub const PATIENTS: &str = "hechos_pacientes";
    pub const APPOINTMENTS: &str = "hechos_citas";
    pub const BUDGETS: &str = "hechos_presupuestos";
    pub const PAYMENT_TRANSACTIONS: &str = "hechos_pagos";
    pub const PAYMENT_APPLICATIONS: &str = "hechos_aplicaciones_pago";
    pub const EXPENSES: &str = "hechos_gastos";
    pub const TREATMENTS: &str = "dimension_tratamientos";
    pub const BRANCHES: &str = "dimension_sucursales";
    pub const PROCEDURES: &str = "dimension_prestaciones";
    pub const PATIENT_TYPES: &str = "dimension_tipos_paciente";

    pub const CONSOLIDATED: &str = "hechos_consolidado";
    pub const BUDGET_DETAIL: &str = "hechos_presupuestos_detalle";
    pub const PAYMENT_APPLICATION_DETAIL: &str = "hechos_aplicaciones_pago_detalle";
}

/// The closed set of entities the pipeline knows how to enrich and join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Patient,
    Appointment,
    Budget,
    Payment,
    Treatment,
    Branch,
    Procedure,
    PatientType,
    Expense,
}

const ENTITY_ALIASES: &[(EntityKind, &[&str])] = &[
    (EntityKind::Patient, &["pacientes", "paciente", "patients"]),
    (
        EntityKind::Appointment,
        &["citas", "cita", "atenciones", "appointments"],
    ),
    (EntityKind::Budget, &["presupuestos", "presupuesto", "budgets"]),
    (EntityKind::Payment, &["pagos", "pago", "payments"]),
    (EntityKind::Treatment, &["tratamientos", "tratamiento", "treatments"]),
    (EntityKind::Branch, &["sucursales", "sucursal", "branches"]),
    (
        EntityKind::Procedure,
        &["prestaciones", "procedimientos", "procedures"],
    ),
    (
        EntityKind::PatientType,
        &["tipos_paciente", "tipo_paciente", "tipos_de_paciente", "origenes"],
    ),
    (EntityKind::Expense, &["gastos", "gasto", "expenses"]),
];

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Patient,
        EntityKind::Appointment,
        EntityKind::Budget,
        EntityKind::Payment,
        EntityKind::Treatment,
        EntityKind::Branch,
        EntityKind::Procedure,
        EntityKind::PatientType,
        EntityKind::Expense,
    ];

    /// Resolve a file base name (any casing or spacing) to an entity.
    pub fn from_base_name(base_name: &str) -> Option<EntityKind> {
        let name = canonical_name(base_name);
        ENTITY_ALIASES
            .iter()
            .find(|(_, aliases)| aliases.contains(&name.as_str()))
            .map(|(kind, _)| *kind)
    }

    /// Output table name for the entity after enrichment. Payments produce two
    /// tables; this is the transaction-level one.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Patient => tables::PATIENTS,
            EntityKind::Appointment => tables::APPOINTMENTS,
            EntityKind::Budget => tables::BUDGETS,
            EntityKind::Payment => tables::PAYMENT_TRANSACTIONS,
            EntityKind::Treatment => tables::TREATMENTS,
            EntityKind::Branch => tables::BRANCHES,
            EntityKind::Procedure => tables::PROCEDURES,
            EntityKind::PatientType => tables::PATIENT_TYPES,
            EntityKind::Expense => tables::EXPENSES,
        }
    }

    /// Short label used for join suffixes and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Patient => "paciente",
            EntityKind::Appointment => "cita",
            EntityKind::Budget => "presupuesto",
            EntityKind::Payment => "pago",
            EntityKind::Treatment => "tratamiento",
            EntityKind::Branch => "sucursal",
            EntityKind::Procedure => "prestacion",
            EntityKind::PatientType => "tipo_paciente",
            EntityKind::Expense => "gasto",
        }
    }

    pub fn is_dimension(&self) -> bool {
        matches!(
            self,
            EntityKind::Treatment
                | EntityKind::Branch
                | EntityKind::Procedure
                | EntityKind::PatientType
        )
    }
}
